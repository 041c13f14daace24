//! In-memory cloud provider for simulations.

use std::collections::BTreeSet;

use tracing::debug;

use vmmad_core::{ObservedState, PortError, PortResult, VmId, VmRecord, VmStatus};
use vmmad_orchestrator::CloudProvider;

/// Accepts every request and never boots anything by itself: VMs become
/// ready through the orchestrator's startup countdown.
#[derive(Debug, Default)]
pub struct DummyCloud {
    running: BTreeSet<VmId>,
    terminated: BTreeSet<VmId>,
    starts: usize,
    stops: usize,
}

impl DummyCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start requests received so far.
    pub fn starts(&self) -> usize {
        self.starts
    }

    /// Stop requests accepted so far.
    pub fn stops(&self) -> usize {
        self.stops
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }
}

impl CloudProvider for DummyCloud {
    async fn start_vm(&mut self, vm: &VmRecord) -> PortResult<()> {
        debug!(vm = %vm.id(), "dummy cloud starting VM");
        self.running.insert(vm.id().to_string());
        self.terminated.remove(vm.id());
        self.starts += 1;
        Ok(())
    }

    async fn stop_vm(&mut self, vm: &VmRecord) -> PortResult<bool> {
        if vm.permanent {
            return Err(PortError::Rejected(format!(
                "{} is a permanent node",
                vm.id()
            )));
        }
        debug!(vm = %vm.id(), "dummy cloud stopping VM");
        self.running.remove(vm.id());
        self.terminated.insert(vm.id().to_string());
        self.stops += 1;
        Ok(true)
    }

    async fn refresh_status(&mut self, vms: &[&VmRecord]) -> PortResult<Vec<VmStatus>> {
        Ok(vms
            .iter()
            .filter_map(|vm| {
                let observed = if self.running.contains(vm.id()) {
                    ObservedState::Starting
                } else if self.terminated.contains(vm.id()) {
                    ObservedState::Terminated
                } else {
                    return None;
                };
                Some(VmStatus {
                    id: vm.id().to_string(),
                    observed,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracks_started_and_stopped_vms() {
        let mut cloud = DummyCloud::new();
        let vm = VmRecord::new("vm-1").unwrap();
        let stranger = VmRecord::new("vm-9").unwrap();

        cloud.start_vm(&vm).await.unwrap();
        let statuses = cloud.refresh_status(&[&vm, &stranger]).await.unwrap();
        assert_eq!(
            statuses,
            vec![VmStatus {
                id: "vm-1".to_string(),
                observed: ObservedState::Starting,
            }]
        );

        assert!(cloud.stop_vm(&vm).await.unwrap());
        let statuses = cloud.refresh_status(&[&vm]).await.unwrap();
        assert_eq!(statuses[0].observed, ObservedState::Terminated);
        assert_eq!((cloud.starts(), cloud.stops(), cloud.running()), (1, 1, 0));
    }

    #[tokio::test]
    async fn permanent_nodes_cannot_be_stopped() {
        let mut cloud = DummyCloud::new();
        let node = VmRecord::permanent_node("clusternode-0").unwrap();
        let err = cloud.stop_vm(&node).await.unwrap_err();
        assert!(matches!(err, PortError::Rejected(_)));
        assert_eq!(cloud.stops(), 0);
    }
}
