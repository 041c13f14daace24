//! vmmad-sim: trace-driven simulation of the elastic-capacity orchestrator.
//!
//! # Usage
//!
//! ```text
//! vmmad-sim --csv-file jobs.csv --output-file report.csv \
//!     --max-vms 20 --max-idle 3600 --startup-delay 180 --cluster-size 4
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use vmmad_core::VmmadConfig;
use vmmad_sim::{
    Simulation, SimulationHooks, SimulationSetup, parse_start_time, secs_to_cycles, trace,
};

#[derive(Parser)]
#[command(name = "vmmad-sim", about = "Replay a job trace through the vmmad orchestrator")]
struct Cli {
    /// Job trace (`job_id,submitted_at,duration`).
    #[arg(long, default_value = "accounting.csv")]
    csv_file: PathBuf,

    /// Per-cycle CSV report.
    #[arg(long, default_value = "main_sim.txt")]
    output_file: PathBuf,

    /// TOML file with `[orchestrator]` and `[policy]` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of cloud VMs, cluster nodes not included.
    #[arg(long)]
    max_vms: Option<usize>,

    /// Maximum VM starts plus stops per cycle.
    #[arg(long)]
    max_delta: Option<usize>,

    /// Seconds a VM may stay idle before it is stopped.
    #[arg(long)]
    max_idle: Option<u64>,

    /// Seconds a VM takes to boot.
    #[arg(long)]
    startup_delay: Option<u64>,

    /// Permanent cluster nodes available from the start.
    #[arg(long, default_value = "0")]
    cluster_size: usize,

    /// Simulated start time, as UNIX seconds or `YYYY-MM-DDTHH:MM:SS`
    /// (UTC); defaults to the first submission.
    #[arg(long)]
    start_time: Option<String>,

    /// Simulated seconds per cycle.
    #[arg(long, default_value = "60")]
    time_interval: u64,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    summary_json: bool,
}

impl Cli {
    fn setup(&self) -> anyhow::Result<SimulationSetup> {
        let mut config = match &self.config {
            Some(path) => VmmadConfig::from_file(path)?,
            None => VmmadConfig::default(),
        };
        let interval = self.time_interval.max(1);

        if let Some(max_vms) = self.max_vms {
            config.orchestrator.max_vms = max_vms;
        }
        if let Some(max_delta) = self.max_delta {
            config.orchestrator.max_delta = max_delta;
        }
        if let Some(max_idle) = self.max_idle {
            config.policy.idle_threshold = i64::try_from(secs_to_cycles(max_idle, interval))
                .context("--max-idle out of range")?;
        }
        if let Some(startup_delay) = self.startup_delay {
            config.orchestrator.startup_delay = secs_to_cycles(startup_delay, interval);
        }

        let start_time = self
            .start_time
            .as_deref()
            .map(parse_start_time)
            .transpose()
            .context("--start-time")?;

        Ok(SimulationSetup {
            config,
            cluster_size: self.cluster_size,
            start_time,
            time_interval: interval,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vmmad=debug"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let setup = cli.setup()?;
    let jobs = trace::load(&cli.csv_file)?;
    info!(path = ?cli.csv_file, jobs = jobs.len(), "trace loaded");

    let hooks = SimulationHooks::to_file(&cli.output_file)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut simulation = Simulation::new(setup, jobs, hooks)?.with_shutdown(shutdown_rx);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let outcome = simulation.run(0).await;
    info!(
        cycles = outcome.summary.cycles,
        reason = ?outcome.summary.reason,
        jobs_completed = outcome.jobs_completed,
        vms_started = outcome.vms_started,
        report = ?cli.output_file,
        "simulation finished"
    );

    if cli.summary_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    }
    Ok(())
}
