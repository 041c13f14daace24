//! Error types for the orchestrator and its ports.

use serde::Serialize;
use thiserror::Error;

use crate::types::{VmId, VmState};

/// Result type alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Result type alias for calls into the batch system or cloud provider.
pub type PortResult<T> = Result<T, PortError>;

/// Errors surfaced synchronously by the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed record or configuration. Never enters the tables.
    #[error("validation error: {0}")]
    Validation(String),

    /// The operation would break a core invariant and was rejected.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("unknown VM: {0}")]
    UnknownVm(VmId),

    #[error("port error: {0}")]
    Port(#[from] PortError),
}

/// A failed call into an external system. Always transient from the
/// loop's point of view: the update is skipped and retried next cycle.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Something that went wrong during a cycle without stopping it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Incident {
    /// A `Starting` VM did not become ready within `vm_start_timeout`.
    ProvisioningTimeout { vm: VmId, elapsed_cycles: u64 },
    /// A port call failed or timed out.
    PortFailure { operation: String, error: String },
    /// An operation was rejected because it would break an invariant.
    InvariantViolation { message: String },
    /// The provider reported a VM gone that we did not ask to stop.
    VmLost { vm: VmId, state: VmState },
}
