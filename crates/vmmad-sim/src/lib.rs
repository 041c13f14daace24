//! vmmad-sim: replays a batch-system accounting trace through the
//! orchestrator to evaluate provisioning policies offline.
//!
//! The orchestrator runs unmodified; only its ports are simulated:
//! - [`replay::ReplayBatchSystem`] submits and finishes trace jobs on the
//!   logical clock
//! - [`cloud::DummyCloud`] accepts every start and stop
//! - [`report::SimulationHooks`] writes a per-cycle CSV and ends the run
//!   once the trace is drained

pub mod cloud;
pub mod replay;
pub mod report;
pub mod simulation;
pub mod trace;

pub use cloud::DummyCloud;
pub use replay::ReplayBatchSystem;
pub use report::{CSV_HEADER, SimulationHooks};
pub use simulation::{
    Simulation, SimulationOutcome, SimulationSetup, parse_start_time, secs_to_cycles,
};
pub use trace::TraceJob;
