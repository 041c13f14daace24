//! vmmad.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmmadConfig {
    pub orchestrator: OrchestratorConfig,
    pub policy: PolicyConfig,
}

/// Limits the control loop enforces. Immutable once the loop is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on the size of the VM table, permanent nodes included.
    pub max_vms: usize,
    /// Start plus stop requests allowed per cycle.
    pub max_delta: usize,
    /// Cycles a VM may stay `Starting` before it is given up on.
    pub vm_start_timeout: u64,
    /// Cycles until a new VM is presumed ready without provider confirmation.
    pub startup_delay: u64,
    /// Bound on every batch-system and cloud-provider call.
    pub port_timeout_ms: u64,
    /// Pause between cycles. Zero runs cycles back to back.
    pub cycle_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_vms: 10,
            max_delta: 1,
            vm_start_timeout: 10,
            startup_delay: 1,
            port_timeout_ms: 30_000,
            cycle_interval_ms: 0,
        }
    }
}

impl OrchestratorConfig {
    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.max_vms < 1 {
            return Err(OrchestratorError::Validation(
                "max_vms must be at least 1".to_string(),
            ));
        }
        if self.max_delta < 1 {
            return Err(OrchestratorError::Validation(
                "max_delta must be at least 1".to_string(),
            ));
        }
        if self.port_timeout_ms == 0 {
            return Err(OrchestratorError::Validation(
                "port_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters of the reference threshold policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Idle cycles a VM must exceed before it may be stopped.
    pub idle_threshold: i64,
    /// New VM wanted while candidates > demand_factor × VMs.
    pub demand_factor: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            idle_threshold: 2,
            demand_factor: 2,
        }
    }
}

impl VmmadConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: VmmadConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        self.orchestrator.validate()?;
        if self.policy.idle_threshold < 0 {
            return Err(OrchestratorError::Validation(
                "policy.idle_threshold must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = VmmadConfig::from_toml_str("").unwrap();
        assert_eq!(config, VmmadConfig::default());
        assert_eq!(config.orchestrator.max_delta, 1);
        assert_eq!(config.policy.demand_factor, 2);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[orchestrator]
max_vms = 4
vm_start_timeout = 3

[policy]
idle_threshold = 5
"#;
        let config = VmmadConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.orchestrator.max_vms, 4);
        assert_eq!(config.orchestrator.vm_start_timeout, 3);
        assert_eq!(config.orchestrator.max_delta, 1);
        assert_eq!(config.policy.idle_threshold, 5);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let err = VmmadConfig::from_toml_str("[orchestrator]\nmax_vms = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_vms"));

        let mut config = VmmadConfig::default();
        config.orchestrator.max_delta = 0;
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_roundtrip_through_file() {
        let mut config = VmmadConfig::default();
        config.orchestrator.max_vms = 32;
        config.policy.idle_threshold = 7;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = VmmadConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_file_errors_name_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = VmmadConfig::from_file(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[orchestrator]\nmax_vms = 0\n").unwrap();
        let err = VmmadConfig::from_file(&bad).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("bad.toml"));
        assert!(message.contains("max_vms"));
    }

    #[test]
    fn test_durations() {
        let config = OrchestratorConfig {
            port_timeout_ms: 1500,
            cycle_interval_ms: 60_000,
            ..Default::default()
        };
        assert_eq!(config.port_timeout(), Duration::from_millis(1500));
        assert_eq!(config.cycle_interval(), Duration::from_secs(60));
    }
}
