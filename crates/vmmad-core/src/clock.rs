//! The loop's notion of "now", supplied explicitly.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Source of domain time for a cycle.
pub trait Clock: Send + Sync {
    /// Current time, given the loop's cycle counter.
    fn now(&self, cycle: u64) -> Timestamp;
}

/// Wall-clock time in Unix seconds. Ignores the cycle counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self, _cycle: u64) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Deterministic clock: `start + cycle × interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleClock {
    pub start: Timestamp,
    pub interval: u64,
}

impl CycleClock {
    pub fn new(start: Timestamp, interval: u64) -> Self {
        Self { start, interval }
    }
}

impl Clock for CycleClock {
    fn now(&self, cycle: u64) -> Timestamp {
        self.start.saturating_add(cycle.saturating_mul(self.interval))
    }
}
