//! Records owned by the control loop and the observations reported by
//! the batch system and the cloud provider.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Opaque VM identifier, unique within the VM table.
pub type VmId = String;

/// Job identifier as assigned by the batch system.
pub type JobId = String;

/// Domain time in seconds. Real clock in production, derived from the
/// cycle counter in simulation.
pub type Timestamp = u64;

// ── VM ────────────────────────────────────────────────────────────

/// Lifecycle state of a VM record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Starting,
    Ready,
    Stopping,
}

impl VmState {
    pub fn label(&self) -> &'static str {
        match self {
            VmState::Starting => "STARTING",
            VmState::Ready => "READY",
            VmState::Stopping => "STOPPING",
        }
    }
}

/// A VM known to the orchestrator.
///
/// `idle_counter` does double duty: while `Starting` it counts up from
/// `-startup_delay` and the VM is presumed ready once it reaches zero;
/// while `Ready` with no jobs it counts consecutive idle cycles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRecord {
    id: VmId,
    pub state: VmState,
    pub auth_token: String,
    pub node_name: Option<String>,
    pub assigned_jobs: BTreeSet<JobId>,
    pub idle_counter: i64,
    pub permanent: bool,
    /// Cycle at which the record entered the VM table.
    pub started_cycle: u64,
}

impl VmRecord {
    /// Create a `Starting` record with a fresh auth token.
    ///
    /// Fails with `Validation` if `id` is empty.
    pub fn new(id: impl Into<VmId>) -> OrchestratorResult<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "VM record requires a non-empty id".to_string(),
            ));
        }
        Ok(Self {
            id,
            state: VmState::Starting,
            auth_token: uuid::Uuid::new_v4().simple().to_string(),
            node_name: None,
            assigned_jobs: BTreeSet::new(),
            idle_counter: 0,
            permanent: false,
            started_cycle: 0,
        })
    }

    /// A pre-existing node: `Ready`, attached under its own id, never stopped.
    pub fn permanent_node(id: impl Into<VmId>) -> OrchestratorResult<Self> {
        let vm = Self::new(id)?;
        let name = vm.id.clone();
        Ok(vm
            .with_state(VmState::Ready)
            .with_node_name(name)
            .with_permanent(true))
    }

    pub fn with_state(mut self, state: VmState) -> Self {
        self.state = state;
        self
    }

    pub fn with_node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    pub fn with_permanent(mut self, permanent: bool) -> Self {
        self.permanent = permanent;
        self
    }

    pub fn with_idle_counter(mut self, idle_counter: i64) -> Self {
        self.idle_counter = idle_counter;
        self
    }

    pub fn with_started_cycle(mut self, cycle: u64) -> Self {
        self.started_cycle = cycle;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when no job is assigned to this VM.
    pub fn is_idle(&self) -> bool {
        self.assigned_jobs.is_empty()
    }

    /// `Ready` and without jobs: can take a job or be considered for stop.
    pub fn is_available(&self) -> bool {
        self.state == VmState::Ready && self.is_idle()
    }

    /// Record a job as executing here. Resets the idle counter.
    pub fn assign(&mut self, job_id: impl Into<JobId>) {
        self.assigned_jobs.insert(job_id.into());
        self.idle_counter = 0;
    }

    /// Drop a job from the assignment set. Returns whether it was present.
    pub fn release(&mut self, job_id: &str) -> bool {
        self.assigned_jobs.remove(job_id)
    }

    /// Name the batch system knows this VM by, falling back to the id.
    pub fn display_node(&self) -> &str {
        self.node_name.as_deref().unwrap_or(&self.id)
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle state of a job. Ordered: a state only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    /// The later of `self` and `reported`.
    pub fn advance(self, reported: JobState) -> JobState {
        self.max(reported)
    }
}

/// A job as reported by the batch system on one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub submitted_at: Timestamp,
}

impl JobSnapshot {
    pub fn pending(id: impl Into<JobId>, submitted_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            state: JobState::Pending,
            submitted_at,
        }
    }
}

/// A job tracked by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    pub submitted_at: Timestamp,
    pub running_at: Option<Timestamp>,
    pub exec_node: Option<String>,
}

impl JobRecord {
    pub fn from_snapshot(snapshot: &JobSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            state: snapshot.state,
            submitted_at: snapshot.submitted_at,
            running_at: None,
            exec_node: None,
        }
    }

    /// Fold a newer report into this record. Returns true if the state moved.
    pub fn merge(&mut self, snapshot: &JobSnapshot) -> bool {
        let next = self.state.advance(snapshot.state);
        let changed = next != self.state;
        self.state = next;
        changed
    }

    /// `Pending → Running` on the given node.
    pub fn mark_running(&mut self, node: &str, at: Timestamp) {
        self.state = JobState::Running;
        self.exec_node = Some(node.to_string());
        self.running_at = Some(at);
    }

    pub fn is_active(&self) -> bool {
        self.state != JobState::Done
    }
}

// ── Provider observations ─────────────────────────────────────────

/// What the cloud provider currently sees for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObservedState {
    /// Still booting, or nothing new to report.
    Starting,
    /// Booted and attached to the batch system under `node_name`.
    Ready { node_name: String },
    /// Gone on the provider side.
    Terminated,
}

/// One entry of a `refresh_status` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmStatus {
    pub id: VmId,
    pub observed: ObservedState,
}
