//! Job accounting traces.
//!
//! A trace is a CSV file with one job per line:
//!
//! ```text
//! job_id,submitted_at,duration
//! 1001,1300000000,3600
//! ```
//!
//! `submitted_at` is UNIX seconds, `duration` is wall-clock seconds.
//! A header line, blank lines and `#` comments are skipped.

use std::path::Path;

use anyhow::{Context, Result, bail};

use vmmad_core::{JobId, Timestamp};

/// One job as recorded in the accounting trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceJob {
    pub id: JobId,
    pub submitted_at: Timestamp,
    pub duration: u64,
}

/// Read and parse a trace file.
pub fn load(path: &Path) -> Result<Vec<TraceJob>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading trace {}", path.display()))?;
    parse(&content).with_context(|| format!("parsing trace {}", path.display()))
}

/// Parse trace content. Jobs come back in file order.
pub fn parse(content: &str) -> Result<Vec<TraceJob>> {
    let mut jobs = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let lineno = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 3 {
            bail!("line {lineno}: expected 3 fields, found {}", fields.len());
        }
        if jobs.is_empty() && fields[1].parse::<u64>().is_err() {
            // Header.
            continue;
        }
        if fields[0].is_empty() {
            bail!("line {lineno}: empty job id");
        }

        let submitted_at = fields[1]
            .parse::<Timestamp>()
            .with_context(|| format!("line {lineno}: bad submission time {:?}", fields[1]))?;
        let duration = fields[2]
            .parse::<u64>()
            .with_context(|| format!("line {lineno}: bad duration {:?}", fields[2]))?;

        jobs.push(TraceJob {
            id: fields[0].to_string(),
            submitted_at,
            duration,
        });
    }

    Ok(jobs)
}
