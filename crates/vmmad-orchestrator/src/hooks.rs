//! Extension points around each cycle.
//!
//! Reporting and termination checks plug in here instead of overriding
//! pieces of the loop.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::info;

use vmmad_core::{Incident, JobId, JobRecord, JobState, Timestamp, VmId, VmRecord, VmState};

use crate::orchestrator::RunSummary;

/// What a before-hook wants the loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    /// End the run cleanly without executing this cycle.
    Stop,
}

/// Read-only view of the orchestrator at a cycle boundary.
#[derive(Debug, Clone, Copy)]
pub struct CycleView<'a> {
    pub cycle: u64,
    pub now: Timestamp,
    pub vms: &'a BTreeMap<VmId, VmRecord>,
    pub jobs: &'a BTreeMap<JobId, JobRecord>,
    pub candidates: &'a [JobId],
    /// The batch system still expects jobs it has not reported yet.
    pub future_jobs_expected: bool,
}

impl CycleView<'_> {
    pub fn running_jobs(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Running)
            .count()
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .count()
    }

    /// VMs in `state`, permanent nodes excluded.
    pub fn cloud_vms_in(&self, state: VmState) -> usize {
        self.vms
            .values()
            .filter(|vm| !vm.permanent && vm.state == state)
            .count()
    }

    pub fn cloud_vms(&self) -> usize {
        self.vms.values().filter(|vm| !vm.permanent).count()
    }

    /// Nothing pending, nothing running, nothing more to come.
    pub fn is_drained(&self) -> bool {
        !self.future_jobs_expected && !self.jobs.values().any(JobRecord::is_active)
    }
}

/// Everything that happened during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub now: Timestamp,
    /// VMs whose start request was issued.
    pub started: Vec<VmId>,
    /// VMs whose stop was confirmed and which left the table.
    pub stopped: Vec<VmId>,
    pub became_ready: Vec<VmId>,
    /// `(job, vm)` pairs dispatched this cycle.
    pub dispatched: Vec<(JobId, VmId)>,
    /// Start plus stop requests issued, counted against `max_delta`.
    pub actions: usize,
    pub incidents: Vec<Incident>,
}

impl CycleReport {
    pub fn new(cycle: u64, now: Timestamp) -> Self {
        Self {
            cycle,
            now,
            ..Default::default()
        }
    }
}

/// Callbacks invoked by the loop. All default to no-ops.
pub trait Hooks: Send {
    /// Runs before anything else in a cycle.
    fn before(&mut self, view: &CycleView<'_>) -> HookAction {
        let _ = view;
        HookAction::Continue
    }

    /// Runs after scale-in, before the cycle counter moves.
    fn after(&mut self, report: &CycleReport, view: &CycleView<'_>) {
        let _ = (report, view);
    }

    /// Runs once when `run` returns, whatever the reason.
    fn finish(&mut self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// No extension behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Stops the loop once all work is drained.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainedStop;

impl Hooks for DrainedStop {
    fn before(&mut self, view: &CycleView<'_>) -> HookAction {
        if view.is_drained() {
            info!(cycle = view.cycle, "no more jobs, stopping here");
            HookAction::Stop
        } else {
            HookAction::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmmad_core::JobSnapshot;

    fn view<'a>(
        vms: &'a BTreeMap<VmId, VmRecord>,
        jobs: &'a BTreeMap<JobId, JobRecord>,
        future: bool,
    ) -> CycleView<'a> {
        CycleView {
            cycle: 4,
            now: 400,
            vms,
            jobs,
            candidates: &[],
            future_jobs_expected: future,
        }
    }

    #[test]
    fn drained_when_no_jobs_and_no_future_jobs() {
        let vms = BTreeMap::new();
        let jobs = BTreeMap::new();
        let mut hook = DrainedStop;

        assert_eq!(hook.before(&view(&vms, &jobs, false)), HookAction::Stop);
        assert_eq!(hook.before(&view(&vms, &jobs, true)), HookAction::Continue);
    }

    #[test]
    fn finished_jobs_do_not_keep_loop_alive() {
        let vms = BTreeMap::new();
        let mut jobs = BTreeMap::new();
        let mut done = JobRecord::from_snapshot(&JobSnapshot::pending("j1", 0));
        done.state = JobState::Done;
        jobs.insert("j1".to_string(), done);

        assert!(view(&vms, &jobs, false).is_drained());

        let pending = JobRecord::from_snapshot(&JobSnapshot::pending("j2", 5));
        jobs.insert("j2".to_string(), pending);
        let v = view(&vms, &jobs, false);
        assert!(!v.is_drained());
        assert_eq!(v.pending_jobs(), 1);
        assert_eq!(v.running_jobs(), 0);
    }

    #[test]
    fn cloud_vm_counts_skip_permanent_nodes() {
        let mut vms = BTreeMap::new();
        let node = VmRecord::permanent_node("clusternode-0").unwrap();
        let cloud = VmRecord::new("vm-1").unwrap();
        vms.insert(node.id().to_string(), node);
        vms.insert(cloud.id().to_string(), cloud);
        let jobs = BTreeMap::new();

        let v = view(&vms, &jobs, false);
        assert_eq!(v.cloud_vms(), 1);
        assert_eq!(v.cloud_vms_in(VmState::Starting), 1);
        assert_eq!(v.cloud_vms_in(VmState::Ready), 0);
    }
}
