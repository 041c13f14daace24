//! Trace-driven simulation: the orchestrator against a replayed batch
//! system and an in-memory cloud, on a logical clock.

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use vmmad_core::{CycleClock, Timestamp, VmRecord, VmmadConfig};
use vmmad_orchestrator::{BatchSystem, Hooks, Orchestrator, RunSummary, ThresholdPolicy};

use crate::cloud::DummyCloud;
use crate::replay::ReplayBatchSystem;
use crate::trace::TraceJob;

pub type SimOrchestrator = Orchestrator<ReplayBatchSystem, DummyCloud, ThresholdPolicy>;

/// Everything needed to assemble a simulation besides the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationSetup {
    /// Loop settings. `max_vms` counts cloud VMs only; cluster nodes are
    /// added on top.
    pub config: VmmadConfig,
    /// Permanent nodes present from the start.
    pub cluster_size: usize,
    /// Simulated time of the first job; defaults to the trace's earliest
    /// submission.
    pub start_time: Option<Timestamp>,
    /// Simulated seconds per cycle.
    pub time_interval: u64,
}

impl Default for SimulationSetup {
    fn default() -> Self {
        Self {
            config: VmmadConfig::default(),
            cluster_size: 0,
            start_time: None,
            time_interval: 60,
        }
    }
}

/// Format accepted for `--start-time` besides plain UNIX seconds.
pub const START_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse a start time given either as UNIX seconds or as a UTC
/// `YYYY-MM-DDTHH:MM:SS` date.
pub fn parse_start_time(s: &str) -> Result<Timestamp> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(secs);
    }
    let date = chrono::NaiveDateTime::parse_from_str(s, START_TIME_FORMAT)
        .with_context(|| format!("start time {s:?} is neither UNIX seconds nor {START_TIME_FORMAT}"))?;
    Timestamp::try_from(date.and_utc().timestamp())
        .with_context(|| format!("start time {s:?} is before the UNIX epoch"))
}

/// Seconds to whole cycles, rounding up.
pub fn secs_to_cycles(secs: u64, interval: u64) -> u64 {
    secs.div_ceil(interval.max(1))
}

/// Final numbers of a simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationOutcome {
    pub summary: RunSummary,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub jobs_total: usize,
    pub jobs_completed: usize,
    pub vms_started: usize,
    pub vms_stopped: usize,
}

pub struct Simulation {
    orchestrator: SimOrchestrator,
    start_time: Timestamp,
    jobs_total: usize,
}

impl Simulation {
    pub fn new(setup: SimulationSetup, jobs: Vec<TraceJob>, hooks: impl Hooks + 'static) -> Result<Self> {
        let jobs_total = jobs.len();
        let batch = ReplayBatchSystem::new(jobs);
        let start_time = setup.start_time.or(batch.start_time()).unwrap_or(0);
        let interval = setup.time_interval.max(1);

        let mut config = setup.config.orchestrator.clone();
        config.max_vms = config.max_vms.saturating_add(setup.cluster_size);
        // The dummy cloud never reports readiness, so the countdown must
        // finish before the start timeout.
        config.vm_start_timeout = config
            .vm_start_timeout
            .max(config.startup_delay.saturating_add(1));
        VmmadConfig {
            orchestrator: config.clone(),
            policy: setup.config.policy.clone(),
        }
        .validate()
        .context("invalid simulation configuration")?;

        let policy = ThresholdPolicy::from(&setup.config.policy);
        let clock = CycleClock::new(start_time.saturating_sub(interval), interval);
        info!(
            jobs = jobs_total,
            start_time,
            interval,
            cluster_size = setup.cluster_size,
            max_vms = config.max_vms,
            max_delta = config.max_delta,
            idle_threshold = policy.idle_threshold,
            startup_delay = config.startup_delay,
            "simulation assembled"
        );

        let mut orchestrator = Orchestrator::new(config, batch, DummyCloud::new(), policy)?
            .with_clock(clock)
            .with_hooks(hooks);
        for i in 0..setup.cluster_size {
            orchestrator.adopt_vm(VmRecord::permanent_node(format!("clusternode-{i}"))?)?;
        }

        Ok(Self {
            orchestrator,
            start_time,
            jobs_total,
        })
    }

    /// End the run early when `shutdown` turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.orchestrator = self.orchestrator.with_shutdown(shutdown);
        self
    }

    pub fn orchestrator(&self) -> &SimOrchestrator {
        &self.orchestrator
    }

    /// Run until every trace job has finished, or for `cycles` cycles
    /// when non-zero.
    pub async fn run(&mut self, cycles: u64) -> SimulationOutcome {
        let summary = self.orchestrator.run(cycles).await;
        let cloud = self.orchestrator.cloud();
        SimulationOutcome {
            start_time: self.start_time,
            end_time: self.orchestrator.now(),
            jobs_total: self.jobs_total,
            jobs_completed: self.orchestrator.batch().completed(),
            vms_started: cloud.starts(),
            vms_stopped: cloud.stops(),
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmmad_orchestrator::NoHooks;

    fn job(id: &str, submitted_at: Timestamp, duration: u64) -> TraceJob {
        TraceJob {
            id: id.to_string(),
            submitted_at,
            duration,
        }
    }

    #[test]
    fn seconds_round_up_to_cycles() {
        assert_eq!(secs_to_cycles(0, 60), 0);
        assert_eq!(secs_to_cycles(1, 60), 1);
        assert_eq!(secs_to_cycles(120, 60), 2);
        assert_eq!(secs_to_cycles(121, 60), 3);
        assert_eq!(secs_to_cycles(5, 0), 5);
    }

    #[test]
    fn start_time_accepts_seconds_and_dates() {
        assert_eq!(parse_start_time("1000").unwrap(), 1_000);
        assert_eq!(parse_start_time("1970-01-01T00:16:40").unwrap(), 1_000);
        assert_eq!(parse_start_time("2010-01-01T00:00:00").unwrap(), 1_262_304_000);
        assert!(parse_start_time("1969-12-31T23:59:59").is_err());
        assert!(parse_start_time("2010-01-01").is_err());
        assert!(parse_start_time("yesterday").is_err());
    }

    #[test]
    fn cluster_nodes_are_permanent_and_extra_capacity() {
        let setup = SimulationSetup {
            cluster_size: 2,
            ..Default::default()
        };
        let sim = Simulation::new(setup, vec![job("a", 1_000, 60)], NoHooks).unwrap();
        let orch = sim.orchestrator();

        assert_eq!(orch.config().max_vms, 12);
        assert!(orch.config().vm_start_timeout > orch.config().startup_delay);
        assert!(orch.vm("clusternode-0").unwrap().permanent);
        assert!(orch.vm("clusternode-1").unwrap().permanent);
        // The clock starts one interval before the first submission.
        assert_eq!(orch.now(), 940);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut setup = SimulationSetup::default();
        setup.config.orchestrator.max_delta = 0;
        assert!(Simulation::new(setup, Vec::new(), NoHooks).is_err());
    }
}
