//! External systems the control loop consumes.
//!
//! Implementations live outside this crate: a real batch-system or
//! cloud driver, the trace-replay simulator, or a scripted fake in tests.
//! Every call is bounded by the loop's port timeout and a failure only
//! skips the update it was meant to deliver.

use std::future::Future;

use tokio::sync::mpsc;

use vmmad_core::{JobRecord, JobSnapshot, PortResult, Timestamp, VmRecord, VmStatus};

/// The batch scheduler's view of the job queue.
pub trait BatchSystem: Send {
    /// Current state of every job the batch system knows about.
    ///
    /// Called once per cycle. An empty answer is valid; a job missing
    /// from a successful answer is treated as finished.
    fn poll_jobs(
        &mut self,
        now: Timestamp,
    ) -> impl Future<Output = PortResult<Vec<JobSnapshot>>> + Send;

    /// Earliest known submission time, used to seed a logical clock.
    fn start_time(&self) -> Option<Timestamp> {
        None
    }

    /// Whether jobs not yet visible in `poll_jobs` are still expected.
    fn has_future_jobs(&self) -> bool {
        false
    }

    /// The loop moved `job` to `Running` on a VM.
    fn job_dispatched(&mut self, job: &JobRecord) -> impl Future<Output = PortResult<()>> + Send {
        let _ = job;
        async { Ok(()) }
    }
}

/// A cloud provider renting out VMs.
pub trait CloudProvider: Send {
    /// Fire a provisioning request. Does not wait for the VM to boot.
    fn start_vm(&mut self, vm: &VmRecord) -> impl Future<Output = PortResult<()>> + Send;

    /// Request termination. Returns whether the request was accepted.
    ///
    /// Must fail for a permanent VM.
    fn stop_vm(&mut self, vm: &VmRecord) -> impl Future<Output = PortResult<bool>> + Send;

    /// Provider-side status of the given VMs, one batched call per cycle.
    ///
    /// VMs missing from the answer keep their current state.
    fn refresh_status(
        &mut self,
        vms: &[&VmRecord],
    ) -> impl Future<Output = PortResult<Vec<VmStatus>>> + Send;
}

/// Out-of-band "VM finished booting" message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyNotice {
    pub auth_token: String,
    pub node_name: String,
}

/// Handle for delivering readiness notices from outside the loop.
///
/// Notices are applied at the start of the next VM refresh.
#[derive(Debug, Clone)]
pub struct ReadyNotifier {
    tx: mpsc::UnboundedSender<ReadyNotice>,
}

impl ReadyNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ReadyNotice>) -> Self {
        Self { tx }
    }

    /// Queue a notice. Returns false once the orchestrator is gone.
    pub fn vm_is_ready(&self, auth_token: impl Into<String>, node_name: impl Into<String>) -> bool {
        self.tx
            .send(ReadyNotice {
                auth_token: auth_token.into(),
                node_name: node_name.into(),
            })
            .is_ok()
    }
}
