//! Orchestrator: the control loop.
//!
//! Owns the VM and job tables and drives them one cycle at a time:
//! refresh job state, refresh VM state, dispatch candidates to idle
//! ready VMs, scale out, scale in. Port failures are logged and skipped;
//! the loop never aborts a cycle because an external system misbehaved.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use vmmad_core::{
    Clock, Incident, JobId, JobRecord, JobSnapshot, JobState, ObservedState, OrchestratorConfig,
    OrchestratorError, OrchestratorResult, PortError, PortResult, SystemClock, Timestamp, VmId,
    VmRecord, VmState, VmStatus,
};

use crate::hooks::{CycleReport, CycleView, HookAction, Hooks, NoHooks};
use crate::policy::{Policy, PolicyView};
use crate::ports::{BatchSystem, CloudProvider, ReadyNotice, ReadyNotifier};

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The requested number of cycles ran.
    CycleLimit,
    /// The before-hook reported that no work is left.
    Drained,
    /// The shutdown signal fired.
    Shutdown,
}

/// Outcome of a call to `run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Cycles executed by this call.
    pub cycles: u64,
    /// Value of the cycle counter afterwards.
    pub final_cycle: u64,
    pub reason: StopReason,
    pub vms: usize,
    pub jobs_done: usize,
}

/// The control loop and the state it exclusively owns.
pub struct Orchestrator<B, C, P> {
    config: OrchestratorConfig,
    batch: B,
    cloud: C,
    policy: P,
    hooks: Box<dyn Hooks>,
    clock: Box<dyn Clock>,
    vms: BTreeMap<VmId, VmRecord>,
    jobs: BTreeMap<JobId, JobRecord>,
    candidates: Vec<JobId>,
    cycle: u64,
    /// Sequence for generated VM ids.
    next_vm: u64,
    ready_tx: mpsc::UnboundedSender<ReadyNotice>,
    ready_rx: mpsc::UnboundedReceiver<ReadyNotice>,
    shutdown: Option<watch::Receiver<bool>>,
    /// Report of the cycle in progress.
    report: CycleReport,
    /// VMs a stop was requested for during the cycle in progress.
    stop_requested: BTreeSet<VmId>,
    /// Dispatched jobs the batch system has not acknowledged yet.
    unacknowledged: BTreeSet<JobId>,
}

impl<B, C, P> Orchestrator<B, C, P>
where
    B: BatchSystem,
    C: CloudProvider,
    P: Policy,
{
    /// Create an orchestrator. Fails if the configuration is invalid.
    pub fn new(config: OrchestratorConfig, batch: B, cloud: C, policy: P) -> OrchestratorResult<Self> {
        config.validate()?;
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            batch,
            cloud,
            policy,
            hooks: Box::new(NoHooks),
            clock: Box::new(SystemClock),
            vms: BTreeMap::new(),
            jobs: BTreeMap::new(),
            candidates: Vec::new(),
            cycle: 0,
            next_vm: 0,
            ready_tx,
            ready_rx,
            shutdown: None,
            report: CycleReport::default(),
            stop_requested: BTreeSet::new(),
            unacknowledged: BTreeSet::new(),
        })
    }

    pub fn with_hooks(mut self, hooks: impl Hooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Consult `shutdown` at every cycle boundary; `true` ends the run.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn vms(&self) -> &BTreeMap<VmId, VmRecord> {
        &self.vms
    }

    pub fn vm(&self, id: &str) -> Option<&VmRecord> {
        self.vms.get(id)
    }

    pub fn jobs(&self) -> &BTreeMap<JobId, JobRecord> {
        &self.jobs
    }

    pub fn candidates(&self) -> &[JobId] {
        &self.candidates
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now(self.cycle)
    }

    pub fn batch(&self) -> &B {
        &self.batch
    }

    pub fn batch_mut(&mut self) -> &mut B {
        &mut self.batch
    }

    pub fn cloud(&self) -> &C {
        &self.cloud
    }

    pub fn cloud_mut(&mut self) -> &mut C {
        &mut self.cloud
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Handle for delivering readiness notices from other tasks.
    pub fn notifier(&self) -> ReadyNotifier {
        ReadyNotifier::new(self.ready_tx.clone())
    }

    // ── Running ─────────────────────────────────────────────────────

    /// Run `cycles` cycles, or until stopped when `cycles == 0`.
    pub async fn run(&mut self, cycles: u64) -> RunSummary {
        let interval = self.config.cycle_interval();
        info!(
            cycles,
            max_vms = self.config.max_vms,
            max_delta = self.config.max_delta,
            "orchestrator started"
        );

        let mut executed = 0;
        let reason = loop {
            if cycles != 0 && executed >= cycles {
                break StopReason::CycleLimit;
            }
            if self.shutdown_requested() {
                break StopReason::Shutdown;
            }
            if executed > 0 && !interval.is_zero() && self.wait_for_next_cycle(interval).await {
                break StopReason::Shutdown;
            }
            match self.run_cycle().await {
                Some(_) => executed += 1,
                None => break StopReason::Drained,
            }
        };

        let summary = RunSummary {
            cycles: executed,
            final_cycle: self.cycle,
            reason,
            vms: self.vms.len(),
            jobs_done: self
                .jobs
                .values()
                .filter(|job| job.state == JobState::Done)
                .count(),
        };
        info!(
            cycles = summary.cycles,
            reason = ?summary.reason,
            vms = summary.vms,
            "orchestrator stopped"
        );
        self.hooks.finish(&summary);
        summary
    }

    /// Execute one cycle. Returns `None` if the before-hook ended the run.
    pub async fn run_cycle(&mut self) -> Option<CycleReport> {
        let now = self.now();
        let view = CycleView {
            cycle: self.cycle,
            now,
            vms: &self.vms,
            jobs: &self.jobs,
            candidates: &self.candidates,
            future_jobs_expected: self.batch.has_future_jobs(),
        };
        if self.hooks.before(&view) == HookAction::Stop {
            debug!(cycle = self.cycle, "before-hook requested stop");
            return None;
        }

        self.report = CycleReport::new(self.cycle, now);
        self.stop_requested.clear();

        self.refresh_jobs().await;
        self.refresh_vms().await;
        self.advance_vm_clocks();
        self.reap_stalled_vms().await;
        self.dispatch(now).await;
        self.scale_out().await;
        self.scale_in().await;

        let report = std::mem::take(&mut self.report);
        let view = CycleView {
            cycle: self.cycle,
            now,
            vms: &self.vms,
            jobs: &self.jobs,
            candidates: &self.candidates,
            future_jobs_expected: self.batch.has_future_jobs(),
        };
        self.hooks.after(&report, &view);
        debug!(
            cycle = self.cycle,
            actions = report.actions,
            started = report.started.len(),
            stopped = report.stopped.len(),
            dispatched = report.dispatched.len(),
            incidents = report.incidents.len(),
            "cycle complete"
        );

        self.cycle += 1;
        Some(report)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep until the next cycle. Returns true if shutdown fired meanwhile.
    async fn wait_for_next_cycle(&mut self, interval: Duration) -> bool {
        let Some(rx) = self.shutdown.as_mut() else {
            tokio::time::sleep(interval).await;
            return false;
        };
        let changed = tokio::select! {
            _ = tokio::time::sleep(interval) => return false,
            changed = rx.changed() => changed,
        };
        match changed {
            Ok(()) => *rx.borrow(),
            Err(_) => {
                // Sender gone: no shutdown can arrive any more.
                self.shutdown = None;
                tokio::time::sleep(interval).await;
                false
            }
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────

    /// Pull job states from the batch system and recompute candidates.
    ///
    /// On failure the previous job table is kept as is.
    pub async fn refresh_jobs(&mut self) {
        let now = self.now();
        let limit = self.config.port_timeout();
        match call_port("poll_jobs", limit, self.batch.poll_jobs(now)).await {
            Ok(snapshots) => self.merge_jobs(snapshots),
            Err(e) => {
                warn!(cycle = self.cycle, error = %e, "job poll failed, keeping previous job table");
                self.record_port_failure("poll_jobs", &e);
            }
        }
        self.recompute_candidates();
    }

    fn merge_jobs(&mut self, snapshots: Vec<JobSnapshot>) {
        let mut seen = HashSet::with_capacity(snapshots.len());
        let mut finished = Vec::new();

        for snapshot in &snapshots {
            seen.insert(snapshot.id.as_str());
            match self.jobs.get_mut(&snapshot.id) {
                Some(job) => {
                    let before = job.state;
                    if job.merge(snapshot) {
                        debug!(
                            job = %job.id,
                            from = ?before,
                            to = ?job.state,
                            "job state advanced"
                        );
                        if job.state == JobState::Done {
                            finished.push(job.id.clone());
                        }
                    }
                }
                None => {
                    debug!(job = %snapshot.id, state = ?snapshot.state, "new job");
                    self.jobs
                        .insert(snapshot.id.clone(), JobRecord::from_snapshot(snapshot));
                }
            }
        }

        // A job the batch system stopped reporting is over.
        for job in self.jobs.values_mut() {
            if job.is_active() && !seen.contains(job.id.as_str()) {
                debug!(job = %job.id, state = ?job.state, "job disappeared, marking done");
                job.state = JobState::Done;
                finished.push(job.id.clone());
            }
        }

        for job_id in finished {
            for vm in self.vms.values_mut() {
                if vm.release(&job_id) {
                    info!(
                        cycle = self.cycle,
                        job = %job_id,
                        vm = %vm.id(),
                        "job finished, VM released"
                    );
                }
            }
        }
    }

    /// Pending, policy-eligible, not assigned anywhere; FIFO by submission.
    fn recompute_candidates(&mut self) {
        let assigned: HashSet<&str> = self
            .vms
            .values()
            .flat_map(|vm| vm.assigned_jobs.iter().map(String::as_str))
            .collect();

        let mut pending: Vec<&JobRecord> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Pending)
            .filter(|job| !assigned.contains(job.id.as_str()))
            .filter(|job| self.policy.is_cloud_candidate(job))
            .collect();
        pending.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));

        self.candidates = pending.into_iter().map(|job| job.id.clone()).collect();
    }

    // ── VMs ─────────────────────────────────────────────────────────

    /// Apply queued readiness notices and the provider's view of all
    /// non-permanent VMs. Applying the same observations twice is a no-op.
    pub async fn refresh_vms(&mut self) {
        while let Ok(notice) = self.ready_rx.try_recv() {
            self.vm_is_ready(&notice.auth_token, &notice.node_name);
        }

        let batch: Vec<&VmRecord> = self.vms.values().filter(|vm| !vm.permanent).collect();
        if batch.is_empty() {
            return;
        }
        let limit = self.config.port_timeout();
        match call_port("refresh_status", limit, self.cloud.refresh_status(&batch)).await {
            Ok(statuses) => {
                for status in statuses {
                    self.apply_status(status);
                }
            }
            Err(e) => {
                warn!(cycle = self.cycle, error = %e, "VM status refresh failed, keeping previous VM table");
                self.record_port_failure("refresh_status", &e);
            }
        }
    }

    fn apply_status(&mut self, status: VmStatus) {
        let Some(vm) = self.vms.get_mut(&status.id) else {
            debug!(vm = %status.id, "status for unknown VM ignored");
            return;
        };

        match (vm.state, status.observed) {
            (VmState::Starting, ObservedState::Ready { node_name }) => {
                mark_ready(vm, Some(node_name));
                info!(cycle = self.cycle, vm = %status.id, node = %vm.display_node(), "VM ready");
                self.report.became_ready.push(status.id);
            }
            (VmState::Ready, ObservedState::Ready { node_name }) if vm.node_name.is_none() => {
                vm.node_name = Some(node_name);
            }
            (_, ObservedState::Ready { .. }) | (_, ObservedState::Starting) => {}
            (VmState::Stopping, ObservedState::Terminated) => {
                self.vms.remove(&status.id);
                info!(cycle = self.cycle, vm = %status.id, "VM stop confirmed by provider");
                self.report.stopped.push(status.id);
            }
            (state, ObservedState::Terminated) => {
                if let Some(vm) = self.vms.remove(&status.id) {
                    warn!(
                        cycle = self.cycle,
                        vm = %status.id,
                        state = state.label(),
                        jobs = vm.assigned_jobs.len(),
                        "VM terminated by provider without a stop request"
                    );
                }
                self.report.incidents.push(Incident::VmLost {
                    vm: status.id,
                    state,
                });
            }
        }
    }

    /// Out-of-band readiness: `Starting → Ready` for the VM holding
    /// `auth_token`. Returns whether a transition happened.
    pub fn vm_is_ready(&mut self, auth_token: &str, node_name: &str) -> bool {
        let Some(vm) = self.vms.values_mut().find(|vm| vm.auth_token == auth_token) else {
            warn!(cycle = self.cycle, node = %node_name, "ready notice with unknown auth token");
            return false;
        };
        if vm.state != VmState::Starting {
            debug!(vm = %vm.id(), state = vm.state.label(), "ready notice for VM not starting, ignored");
            return false;
        }

        mark_ready(vm, Some(node_name.to_string()));
        let id = vm.id().to_string();
        info!(cycle = self.cycle, vm = %id, node = %node_name, "VM ready");
        self.report.became_ready.push(id);
        true
    }

    /// Startup countdown for `Starting` VMs, idle count for idle `Ready` ones.
    fn advance_vm_clocks(&mut self) {
        let cycle = self.cycle;
        for vm in self.vms.values_mut() {
            match vm.state {
                VmState::Starting => {
                    vm.idle_counter += 1;
                    if vm.idle_counter >= 0 {
                        mark_ready(vm, None);
                        info!(cycle, vm = %vm.id(), "VM presumed ready after startup delay");
                        self.report.became_ready.push(vm.id().to_string());
                    }
                }
                VmState::Ready if vm.is_idle() => {
                    if !self.report.became_ready.iter().any(|id| id == vm.id()) {
                        vm.idle_counter += 1;
                    }
                }
                VmState::Ready | VmState::Stopping => {}
            }
        }
    }

    /// Give up on cloud VMs stuck in `Starting` past `vm_start_timeout`.
    /// Permanent nodes are left alone.
    async fn reap_stalled_vms(&mut self) {
        let cycle = self.cycle;
        let timeout = self.config.vm_start_timeout;
        let stalled: Vec<(VmId, u64)> = self
            .vms
            .values()
            .filter(|vm| vm.state == VmState::Starting && !vm.permanent)
            .map(|vm| (vm.id().to_string(), cycle.saturating_sub(vm.started_cycle)))
            .filter(|(_, elapsed)| *elapsed > timeout)
            .collect();

        for (id, elapsed) in stalled {
            if let Some(vm) = self.vms.get_mut(&id) {
                vm.state = VmState::Stopping;
            }
            warn!(
                cycle,
                vm = %id,
                elapsed_cycles = elapsed,
                timeout,
                "VM did not become ready in time, giving up on it"
            );
            self.report.incidents.push(Incident::ProvisioningTimeout {
                vm: id.clone(),
                elapsed_cycles: elapsed,
            });
            if self.has_budget() {
                if let Err(e) = self.request_stop(&id).await {
                    debug!(vm = %id, error = %e, "stop of stalled VM will be retried");
                }
            } else {
                debug!(vm = %id, "no action budget left, stop of stalled VM deferred");
            }
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Pair idle ready VMs (id order) with candidates (FIFO).
    ///
    /// Dispatch notices the batch system failed to take in an earlier cycle
    /// are re-sent first.
    async fn dispatch(&mut self, now: Timestamp) {
        let pending: Vec<JobId> = self.unacknowledged.iter().cloned().collect();
        for job_id in pending {
            let still_running = self
                .jobs
                .get(&job_id)
                .is_some_and(|job| job.state == JobState::Running);
            if !still_running {
                self.unacknowledged.remove(&job_id);
                continue;
            }
            debug!(cycle = self.cycle, job = %job_id, "re-sending dispatch notice");
            self.notify_dispatched(&job_id).await;
        }

        let available: Vec<VmId> = self
            .vms
            .values()
            .filter(|vm| vm.is_available())
            .map(|vm| vm.id().to_string())
            .collect();
        let limit = self.config.port_timeout();

        let mut taken = 0;
        for vm_id in available {
            let Some(job_id) = self.candidates.get(taken).cloned() else {
                break;
            };
            taken += 1;

            let Some(vm) = self.vms.get_mut(&vm_id) else {
                continue;
            };
            let node = vm.display_node().to_string();
            vm.assign(job_id.clone());

            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            job.mark_running(&node, now);
            info!(cycle = self.cycle, job = %job_id, vm = %vm_id, node = %node, "job dispatched");

            self.notify_dispatched(&job_id).await;
            self.report.dispatched.push((job_id, vm_id));
        }

        self.candidates.drain(..taken);
    }

    /// Tell the batch system a job started. On failure the notice is kept
    /// and re-sent next cycle.
    async fn notify_dispatched(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let limit = self.config.port_timeout();
        match call_port("job_dispatched", limit, self.batch.job_dispatched(job)).await {
            Ok(()) => {
                self.unacknowledged.remove(job_id);
            }
            Err(e) => {
                warn!(cycle = self.cycle, job = %job_id, error = %e, "batch system not told about dispatch, will retry");
                self.record_port_failure("job_dispatched", &e);
                self.unacknowledged.insert(job_id.to_string());
            }
        }
    }

    // ── Scaling ─────────────────────────────────────────────────────

    fn has_budget(&self) -> bool {
        self.report.actions < self.config.max_delta
    }

    async fn scale_out(&mut self) {
        while self.has_budget() && self.vms.len() < self.config.max_vms {
            let view = PolicyView {
                vms: &self.vms,
                jobs: &self.jobs,
                candidates: &self.candidates,
            };
            if !self.policy.is_new_vm_needed(&view) {
                break;
            }
            if let Err(e) = self.new_vm().await {
                debug!(cycle = self.cycle, error = %e, "scale-out halted for this cycle");
                break;
            }
        }
    }

    /// Create a `Starting` VM record and ask the provider to start it.
    ///
    /// Counts against the cycle's action budget. A start request that
    /// times out keeps the record, since the VM may exist anyway.
    pub async fn new_vm(&mut self) -> OrchestratorResult<VmId> {
        if self.vms.len() >= self.config.max_vms {
            return Err(self.invariant_violation(format!(
                "VM table is full ({} of {})",
                self.vms.len(),
                self.config.max_vms
            )));
        }

        let id = loop {
            self.next_vm += 1;
            let candidate = format!("vm-{}", self.next_vm);
            if !self.vms.contains_key(&candidate) {
                break candidate;
            }
        };
        let startup_delay = i64::try_from(self.config.startup_delay).unwrap_or(i64::MAX);
        let vm = VmRecord::new(id.clone())?
            .with_idle_counter(-startup_delay)
            .with_started_cycle(self.cycle);

        self.report.actions += 1;
        let limit = self.config.port_timeout();
        match call_port("start_vm", limit, self.cloud.start_vm(&vm)).await {
            Ok(()) => {
                info!(cycle = self.cycle, vm = %id, startup_delay, "VM start requested");
            }
            Err(e @ PortError::Timeout { .. }) => {
                warn!(cycle = self.cycle, vm = %id, error = %e, "VM start unconfirmed, tracking it anyway");
                self.record_port_failure("start_vm", &e);
            }
            Err(e) => {
                warn!(cycle = self.cycle, vm = %id, error = %e, "VM start failed");
                self.record_port_failure("start_vm", &e);
                return Err(e.into());
            }
        }

        self.vms.insert(id.clone(), vm);
        self.report.started.push(id.clone());
        Ok(id)
    }

    async fn scale_in(&mut self) {
        // Stops that were rejected or failed earlier.
        let retries: Vec<VmId> = self
            .vms
            .values()
            .filter(|vm| vm.state == VmState::Stopping && !vm.permanent)
            .filter(|vm| !self.stop_requested.contains(vm.id()))
            .map(|vm| vm.id().to_string())
            .collect();
        for id in retries {
            if !self.has_budget() {
                return;
            }
            debug!(cycle = self.cycle, vm = %id, "retrying stop");
            if let Err(e) = self.request_stop(&id).await {
                debug!(vm = %id, error = %e, "stop retry failed");
            }
        }

        let stoppable: Vec<VmId> = {
            let view = PolicyView {
                vms: &self.vms,
                jobs: &self.jobs,
                candidates: &self.candidates,
            };
            self.vms
                .values()
                .filter(|vm| !vm.permanent && vm.is_available())
                .filter(|vm| self.policy.can_vm_be_stopped(vm, &view))
                .map(|vm| vm.id().to_string())
                .collect()
        };
        for id in stoppable {
            if !self.has_budget() {
                debug!(cycle = self.cycle, "action budget exhausted, remaining stops deferred");
                return;
            }
            match self.stop_vm(&id).await {
                Ok(true) => {}
                Ok(false) => debug!(vm = %id, "stop not accepted yet, will retry"),
                Err(e) => debug!(vm = %id, error = %e, "stop failed, will retry"),
            }
        }
    }

    /// Move a VM to `Stopping` and ask the provider to terminate it.
    ///
    /// Returns whether the provider accepted; accepted VMs leave the
    /// table. Permanent VMs are refused with `InvariantViolation` and
    /// left untouched.
    pub async fn stop_vm(&mut self, id: &str) -> OrchestratorResult<bool> {
        let Some(vm) = self.vms.get_mut(id) else {
            return Err(OrchestratorError::UnknownVm(id.to_string()));
        };
        if vm.permanent {
            return Err(self.invariant_violation(format!("refusing to stop permanent VM {id}")));
        }
        if vm.state != VmState::Stopping {
            debug!(vm = %id, from = vm.state.label(), "VM stopping");
            vm.state = VmState::Stopping;
        }
        self.request_stop(id).await
    }

    /// Send a stop request for a VM already marked `Stopping`.
    async fn request_stop(&mut self, id: &str) -> OrchestratorResult<bool> {
        let Some(vm) = self.vms.get(id) else {
            return Ok(true);
        };
        if vm.permanent {
            return Err(self.invariant_violation(format!("refusing to stop permanent VM {id}")));
        }
        self.report.actions += 1;
        self.stop_requested.insert(id.to_string());

        let limit = self.config.port_timeout();
        match call_port("stop_vm", limit, self.cloud.stop_vm(vm)).await {
            Ok(true) => {
                self.vms.remove(id);
                info!(cycle = self.cycle, vm = %id, "VM stopped");
                self.report.stopped.push(id.to_string());
                Ok(true)
            }
            Ok(false) => {
                warn!(cycle = self.cycle, vm = %id, "provider did not accept stop request");
                Ok(false)
            }
            Err(e) => {
                warn!(cycle = self.cycle, vm = %id, error = %e, "VM stop request failed");
                self.record_port_failure("stop_vm", &e);
                Err(e.into())
            }
        }
    }

    // ── Adoption ────────────────────────────────────────────────────

    /// Insert a VM that exists outside the loop's control, typically a
    /// permanent cluster node. A `Starting` VM's start timeout counts from
    /// the current cycle.
    pub fn adopt_vm(&mut self, mut vm: VmRecord) -> OrchestratorResult<()> {
        if self.vms.contains_key(vm.id()) {
            return Err(self.invariant_violation(format!("duplicate VM id {}", vm.id())));
        }
        if self.vms.len() >= self.config.max_vms {
            return Err(self.invariant_violation(format!(
                "cannot adopt {}: VM table is full ({} of {})",
                vm.id(),
                self.vms.len(),
                self.config.max_vms
            )));
        }
        if vm.state == VmState::Starting {
            vm.started_cycle = self.cycle;
        }
        debug!(vm = %vm.id(), state = vm.state.label(), permanent = vm.permanent, "VM adopted");
        self.vms.insert(vm.id().to_string(), vm);
        Ok(())
    }

    // ── Incidents ───────────────────────────────────────────────────

    fn invariant_violation(&mut self, message: String) -> OrchestratorError {
        error!(cycle = self.cycle, %message, "invariant violation");
        self.report.incidents.push(Incident::InvariantViolation {
            message: message.clone(),
        });
        OrchestratorError::InvariantViolation(message)
    }

    fn record_port_failure(&mut self, operation: &str, error: &PortError) {
        self.report.incidents.push(Incident::PortFailure {
            operation: operation.to_string(),
            error: error.to_string(),
        });
    }
}

fn mark_ready(vm: &mut VmRecord, node_name: Option<String>) {
    vm.state = VmState::Ready;
    vm.idle_counter = 0;
    if node_name.is_some() {
        vm.node_name = node_name;
    }
}

/// Bound a port call; an elapsed deadline becomes `PortError::Timeout`.
async fn call_port<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = PortResult<T>>,
) -> PortResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PortError::Timeout {
            operation,
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
