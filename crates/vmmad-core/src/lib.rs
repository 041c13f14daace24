//! vmmad-core: shared types for the elastic-capacity orchestrator.
//!
//! Holds the passive records the control loop owns (`VmRecord`,
//! `JobRecord`), the observations external systems report back
//! (`JobSnapshot`, `VmStatus`), the configuration surface, the clock
//! capability, and the error taxonomy.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, CycleClock, SystemClock};
pub use config::{OrchestratorConfig, PolicyConfig, VmmadConfig};
pub use error::{Incident, OrchestratorError, OrchestratorResult, PortError, PortResult};
pub use types::*;
