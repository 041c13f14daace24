//! Per-cycle CSV report and run termination for simulations.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use vmmad_orchestrator::{CycleReport, CycleView, HookAction, Hooks, RunSummary};

/// Columns: clock time, pending jobs, running jobs, cloud VMs in the table
/// whatever their state, cloud VMs idle for at least one cycle.
pub const CSV_HEADER: &str = "#TimeStamp,Pending Jobs,Running Jobs,Started VMs,Idle VMs";

/// Writes one CSV row per cycle and stops the run once every trace job
/// has been submitted and finished.
pub struct SimulationHooks<W: Write + Send> {
    writer: Option<W>,
    rows: u64,
}

impl SimulationHooks<BufWriter<File>> {
    /// Report into a new file at `path`.
    pub fn to_file(path: &Path) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("creating report {}", path.display()))?;
        Self::new(BufWriter::new(file))
            .with_context(|| format!("writing report header to {}", path.display()))
    }
}

impl<W: Write + Send> SimulationHooks<W> {
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writeln!(writer, "{CSV_HEADER}")?;
        Ok(Self {
            writer: Some(writer),
            rows: 0,
        })
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// The underlying writer, unless a write error disabled it.
    pub fn into_inner(self) -> Option<W> {
        self.writer
    }

    fn write_row(&mut self, view: &CycleView<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let started = view.cloud_vms();
        let idle = view
            .vms
            .values()
            .filter(|vm| !vm.permanent && vm.idle_counter > 0)
            .count();
        let row = writeln!(
            writer,
            "{},{},{},{},{}",
            view.now,
            view.pending_jobs(),
            view.running_jobs(),
            started,
            idle
        );
        match row {
            Ok(()) => self.rows += 1,
            Err(e) => {
                warn!(error = %e, "report write failed, disabling CSV output");
                self.writer = None;
            }
        }
    }
}

impl<W: Write + Send> Hooks for SimulationHooks<W> {
    fn before(&mut self, view: &CycleView<'_>) -> HookAction {
        if view.is_drained() {
            info!(cycle = view.cycle, now = view.now, "no more jobs, stopping here");
            HookAction::Stop
        } else {
            HookAction::Continue
        }
    }

    fn after(&mut self, report: &CycleReport, view: &CycleView<'_>) {
        self.write_row(view);
        info!(
            cycle = report.cycle,
            now = report.now,
            pending = view.pending_jobs(),
            running = view.running_jobs(),
            vms = view.cloud_vms(),
            started = report.started.len(),
            stopped = report.stopped.len(),
            dispatched = report.dispatched.len(),
            "cycle"
        );
    }

    fn finish(&mut self, summary: &RunSummary) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "report flush failed");
            }
        }
        info!(
            cycles = summary.cycles,
            rows = self.rows,
            jobs_done = summary.jobs_done,
            "simulation report complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use vmmad_core::{JobRecord, JobSnapshot, JobState, VmRecord, VmState};
    use vmmad_orchestrator::StopReason;

    fn tables() -> (BTreeMap<String, VmRecord>, BTreeMap<String, JobRecord>) {
        let mut vms = BTreeMap::new();
        for vm in [
            VmRecord::permanent_node("clusternode-0").unwrap(),
            VmRecord::new("vm-1")
                .unwrap()
                .with_state(VmState::Ready)
                .with_idle_counter(2),
            VmRecord::new("vm-2").unwrap().with_idle_counter(-3),
            VmRecord::new("vm-3").unwrap().with_state(VmState::Ready),
        ] {
            vms.insert(vm.id().to_string(), vm);
        }
        let mut jobs = BTreeMap::new();
        let pending = JobRecord::from_snapshot(&JobSnapshot::pending("j1", 10));
        let mut running = JobRecord::from_snapshot(&JobSnapshot::pending("j2", 20));
        running.mark_running("clusternode-0", 30);
        jobs.insert("j1".to_string(), pending);
        jobs.insert("j2".to_string(), running);
        (vms, jobs)
    }

    #[test]
    fn writes_header_and_one_row_per_cycle() {
        let (vms, jobs) = tables();
        let view = CycleView {
            cycle: 0,
            now: 60,
            vms: &vms,
            jobs: &jobs,
            candidates: &[],
            future_jobs_expected: false,
        };
        let mut hooks = SimulationHooks::new(Vec::new()).unwrap();

        assert_eq!(hooks.before(&view), HookAction::Continue);
        hooks.after(&CycleReport::new(0, 60), &view);
        hooks.finish(&RunSummary {
            cycles: 1,
            final_cycle: 1,
            reason: StopReason::CycleLimit,
            vms: 4,
            jobs_done: 0,
        });
        assert_eq!(hooks.rows(), 1);

        let out = String::from_utf8(hooks.into_inner().unwrap()).unwrap();
        assert_eq!(out, format!("{CSV_HEADER}\n60,1,1,3,1\n"));
    }

    #[test]
    fn started_column_counts_booting_and_stopping_vms() {
        let mut vms = BTreeMap::new();
        for vm in [
            VmRecord::new("vm-1").unwrap(),
            VmRecord::new("vm-2").unwrap().with_state(VmState::Stopping),
            VmRecord::permanent_node("clusternode-0").unwrap(),
        ] {
            vms.insert(vm.id().to_string(), vm);
        }
        let jobs = BTreeMap::new();
        let view = CycleView {
            cycle: 4,
            now: 300,
            vms: &vms,
            jobs: &jobs,
            candidates: &[],
            future_jobs_expected: true,
        };
        let mut hooks = SimulationHooks::new(Vec::new()).unwrap();
        hooks.after(&CycleReport::new(4, 300), &view);

        let out = String::from_utf8(hooks.into_inner().unwrap()).unwrap();
        assert_eq!(out.lines().nth(1), Some("300,0,0,2,0"));
    }

    #[test]
    fn stops_when_drained() {
        let (vms, mut jobs) = tables();
        for job in jobs.values_mut() {
            job.state = JobState::Done;
        }
        let mut view = CycleView {
            cycle: 3,
            now: 240,
            vms: &vms,
            jobs: &jobs,
            candidates: &[],
            future_jobs_expected: true,
        };
        let mut hooks = SimulationHooks::new(Vec::new()).unwrap();
        assert_eq!(hooks.before(&view), HookAction::Continue);

        view.future_jobs_expected = false;
        assert_eq!(hooks.before(&view), HookAction::Stop);
    }

    #[test]
    fn report_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let hooks = SimulationHooks::to_file(&path).unwrap();
        drop(hooks.into_inner());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim_end(), CSV_HEADER);
        assert!(SimulationHooks::to_file(&dir.path().join("no/such/dir.csv")).is_err());
    }
}
