//! vmmad-orchestrator: elastic capacity for a batch cluster.
//!
//! Watches the batch system's job table, rents VMs from a cloud provider
//! when pending work piles up, hands pending jobs to ready VMs, and
//! releases VMs that sit idle. One cycle at a time:
//!
//! ```text
//! before-hook ─► refresh_jobs ─► refresh_vms ─► dispatch
//!      ─► scale-out ─► scale-in ─► after-hook ─► cycle += 1
//! ```
//!
//! # Architecture
//!
//! ```text
//! Orchestrator
//!   ├── BatchSystem   (port: poll job states)
//!   ├── CloudProvider (port: start/stop VMs, report their status)
//!   ├── Policy        (candidate / scale-out / scale-in predicates)
//!   ├── Hooks         (before/after each cycle, finish)
//!   └── Clock         (domain "now", wall clock or cycle-derived)
//! ```
//!
//! The loop is the only writer of the VM and job tables. Ports and the
//! policy only ever see shared borrows of them.
//!
//! # Throttling
//!
//! Start and stop requests issued in one cycle share a `max_delta`
//! budget, and the VM table never grows past `max_vms`.

pub mod hooks;
pub mod orchestrator;
pub mod policy;
pub mod ports;

pub use hooks::{CycleReport, CycleView, DrainedStop, HookAction, Hooks, NoHooks};
pub use orchestrator::{Orchestrator, RunSummary, StopReason};
pub use policy::{Policy, PolicyView, ThresholdPolicy};
pub use ports::{BatchSystem, CloudProvider, ReadyNotice, ReadyNotifier};
