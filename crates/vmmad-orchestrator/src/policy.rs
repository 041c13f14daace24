//! Provisioning policy: when to rent capacity and when to release it.

use std::collections::BTreeMap;

use vmmad_core::{JobId, JobRecord, PolicyConfig, VmId, VmRecord};

/// Read-only view of the orchestrator tables handed to a policy.
#[derive(Debug, Clone, Copy)]
pub struct PolicyView<'a> {
    pub vms: &'a BTreeMap<VmId, VmRecord>,
    pub jobs: &'a BTreeMap<JobId, JobRecord>,
    /// Pending jobs eligible for cloud execution, dispatch order.
    pub candidates: &'a [JobId],
}

/// Decision predicates consulted by the control loop.
///
/// Implementations must not hold on to orchestrator state; everything
/// they need is in the arguments.
pub trait Policy: Send {
    /// Whether a pending job may run on cloud capacity.
    fn is_cloud_candidate(&self, job: &JobRecord) -> bool;

    /// Whether current demand warrants starting one more VM.
    fn is_new_vm_needed(&self, view: &PolicyView<'_>) -> bool;

    /// Whether an idle `Ready` VM may be released.
    fn can_vm_be_stopped(&self, vm: &VmRecord, view: &PolicyView<'_>) -> bool;
}

/// Ratio/idle-timeout heuristic.
///
/// - every pending job is a candidate
/// - scale out while `candidates > demand_factor × vms`
/// - stop a non-permanent, job-free VM once `idle_counter > idle_threshold`
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    pub idle_threshold: i64,
    pub demand_factor: usize,
}

impl ThresholdPolicy {
    pub fn new(idle_threshold: i64, demand_factor: usize) -> Self {
        Self {
            idle_threshold,
            demand_factor,
        }
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for ThresholdPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self::new(config.idle_threshold, config.demand_factor)
    }
}

impl Policy for ThresholdPolicy {
    fn is_cloud_candidate(&self, _job: &JobRecord) -> bool {
        true
    }

    fn is_new_vm_needed(&self, view: &PolicyView<'_>) -> bool {
        view.candidates.len() > self.demand_factor * view.vms.len()
    }

    fn can_vm_be_stopped(&self, vm: &VmRecord, _view: &PolicyView<'_>) -> bool {
        !vm.permanent && vm.is_idle() && vm.idle_counter > self.idle_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmmad_core::{JobSnapshot, VmState};

    fn ready_vm(id: &str, idle: i64) -> VmRecord {
        VmRecord::new(id)
            .unwrap()
            .with_state(VmState::Ready)
            .with_idle_counter(idle)
    }

    fn table(vms: Vec<VmRecord>) -> BTreeMap<VmId, VmRecord> {
        vms.into_iter().map(|vm| (vm.id().to_string(), vm)).collect()
    }

    fn candidates(n: usize) -> Vec<JobId> {
        (0..n).map(|i| format!("job-{i}")).collect()
    }

    #[test]
    fn every_job_is_a_candidate() {
        let policy = ThresholdPolicy::default();
        let job = JobRecord::from_snapshot(&JobSnapshot::pending("j1", 0));
        assert!(policy.is_cloud_candidate(&job));
    }

    #[test]
    fn new_vm_needed_when_demand_exceeds_twice_supply() {
        let policy = ThresholdPolicy::new(3, 2);
        let vms = table(vec![ready_vm("a", 0), ready_vm("b", 0)]);
        let jobs = BTreeMap::new();

        let five = candidates(5);
        let view = PolicyView {
            vms: &vms,
            jobs: &jobs,
            candidates: &five,
        };
        assert!(policy.is_new_vm_needed(&view));

        let four = candidates(4);
        let view = PolicyView {
            candidates: &four,
            ..view
        };
        assert!(!policy.is_new_vm_needed(&view));
    }

    #[test]
    fn new_vm_needed_from_empty_table() {
        let policy = ThresholdPolicy::default();
        let vms = BTreeMap::new();
        let jobs = BTreeMap::new();
        let one = candidates(1);
        let view = PolicyView {
            vms: &vms,
            jobs: &jobs,
            candidates: &one,
        };
        assert!(policy.is_new_vm_needed(&view));
    }

    #[test]
    fn stop_only_after_idle_threshold() {
        let policy = ThresholdPolicy::new(3, 2);
        let vms = BTreeMap::new();
        let jobs = BTreeMap::new();
        let view = PolicyView {
            vms: &vms,
            jobs: &jobs,
            candidates: &[],
        };

        assert!(!policy.can_vm_be_stopped(&ready_vm("a", 3), &view));
        assert!(policy.can_vm_be_stopped(&ready_vm("a", 4), &view));

        let mut busy = ready_vm("b", 10);
        busy.assigned_jobs.insert("job-1".to_string());
        assert!(!policy.can_vm_be_stopped(&busy, &view));
    }

    #[test]
    fn permanent_vm_is_never_stoppable() {
        let policy = ThresholdPolicy::new(0, 2);
        let vms = BTreeMap::new();
        let jobs = BTreeMap::new();
        let view = PolicyView {
            vms: &vms,
            jobs: &jobs,
            candidates: &[],
        };

        let node = VmRecord::permanent_node("clusternode-0")
            .unwrap()
            .with_idle_counter(1_000);
        assert!(!policy.can_vm_be_stopped(&node, &view));
    }

    #[test]
    fn built_from_config() {
        let policy = ThresholdPolicy::from(&PolicyConfig {
            idle_threshold: 9,
            demand_factor: 3,
        });
        assert_eq!(policy, ThresholdPolicy::new(9, 3));
    }
}
