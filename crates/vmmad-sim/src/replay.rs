//! Batch system replaying an accounting trace against the logical clock.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use vmmad_core::{JobId, JobRecord, JobSnapshot, JobState, PortError, PortResult, Timestamp};
use vmmad_orchestrator::BatchSystem;

use crate::trace::TraceJob;

#[derive(Debug)]
struct Released {
    job: TraceJob,
    running_at: Option<Timestamp>,
}

/// Releases trace jobs once their submission time has passed and
/// finishes them `duration` seconds after dispatch.
#[derive(Debug, Default)]
pub struct ReplayBatchSystem {
    /// Not yet submitted, ordered by submission time.
    future: VecDeque<TraceJob>,
    released: BTreeMap<JobId, Released>,
    completed: usize,
}

impl ReplayBatchSystem {
    pub fn new(mut jobs: Vec<TraceJob>) -> Self {
        jobs.sort_by(|a, b| (a.submitted_at, &a.id).cmp(&(b.submitted_at, &b.id)));
        Self {
            future: jobs.into(),
            released: BTreeMap::new(),
            completed: 0,
        }
    }

    /// Jobs reported `Done` so far.
    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.released.len()
    }
}

impl BatchSystem for ReplayBatchSystem {
    async fn poll_jobs(&mut self, now: Timestamp) -> PortResult<Vec<JobSnapshot>> {
        while self.future.front().is_some_and(|job| job.submitted_at <= now) {
            if let Some(job) = self.future.pop_front() {
                debug!(job = %job.id, submitted_at = job.submitted_at, "job submitted");
                self.released.insert(
                    job.id.clone(),
                    Released {
                        job,
                        running_at: None,
                    },
                );
            }
        }

        let mut snapshots = Vec::with_capacity(self.released.len());
        let mut finished = Vec::new();
        for (id, entry) in &self.released {
            let state = match entry.running_at {
                Some(start) if start.saturating_add(entry.job.duration) <= now => {
                    finished.push(id.clone());
                    JobState::Done
                }
                Some(_) => JobState::Running,
                None => JobState::Pending,
            };
            snapshots.push(JobSnapshot {
                id: id.clone(),
                state,
                submitted_at: entry.job.submitted_at,
            });
        }

        for id in finished {
            self.released.remove(&id);
            self.completed += 1;
        }
        Ok(snapshots)
    }

    fn start_time(&self) -> Option<Timestamp> {
        self.future.front().map(|job| job.submitted_at)
    }

    fn has_future_jobs(&self) -> bool {
        !self.future.is_empty()
    }

    async fn job_dispatched(&mut self, job: &JobRecord) -> PortResult<()> {
        let Some(entry) = self.released.get_mut(&job.id) else {
            return Err(PortError::Rejected(format!("unknown job {}", job.id)));
        };
        let Some(running_at) = job.running_at else {
            return Err(PortError::Rejected(format!("job {} has no start time", job.id)));
        };
        entry.running_at = Some(running_at);
        Ok(())
    }
}
