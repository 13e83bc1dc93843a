//! Drain state and running totals for a coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether a drain cycle is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrainState {
    Idle,
    Draining,
}

/// In-memory "one drain at a time" flag.
///
/// Not persisted: after a restart the next trigger simply starts a fresh
/// cycle.
#[derive(Debug, Default)]
pub(crate) struct DrainFlag {
    draining: AtomicBool,
}

impl DrainFlag {
    /// Enter `Draining`, or `None` if a cycle is already running.
    pub(crate) fn try_begin(&self) -> Option<DrainGuard<'_>> {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard { flag: self })
    }

    pub(crate) fn state(&self) -> DrainState {
        if self.draining.load(Ordering::Acquire) {
            DrainState::Draining
        } else {
            DrainState::Idle
        }
    }
}

/// Returns the flag to `Idle` when the cycle ends, however it ends.
pub(crate) struct DrainGuard<'a> {
    flag: &'a DrainFlag,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.draining.store(false, Ordering::Release);
    }
}

/// What one drain cycle did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Mutations replayed successfully and removed.
    pub replayed: usize,
    /// Mutations whose replay failed; their retry counters were bumped.
    pub failed: usize,
    /// Mutations dropped by the abandon policy without replay.
    pub abandoned: usize,
    /// Whether the rate limiter cut the cycle short.
    pub rate_limited: bool,
    /// Mutations from this cycle's snapshot still queued at the end.
    pub remaining: usize,
    pub duration: Duration,
}

impl DrainReport {
    /// Whether the cycle left nothing behind.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.rate_limited
    }
}

/// Result of asking for a drain.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    /// A cycle ran to the end (or until the rate limiter said stop).
    Completed(DrainReport),
    /// Another cycle was already running; nothing was done.
    Coalesced,
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Coalesced => None,
        }
    }
}

/// Totals across all cycles of one coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub cycles: u64,
    pub coalesced: u64,
    pub replayed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub last_drain_at: Option<DateTime<Utc>>,
    pub last_report: Option<DrainReport>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &DrainReport) {
        self.cycles += 1;
        self.replayed += report.replayed as u64;
        self.failed += report.failed as u64;
        self.abandoned += report.abandoned as u64;
        self.last_drain_at = Some(Utc::now());
        self.last_report = Some(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_allows_one_cycle() {
        let flag = DrainFlag::default();
        assert_eq!(flag.state(), DrainState::Idle);

        let guard = flag.try_begin();
        assert!(guard.is_some());
        assert_eq!(flag.state(), DrainState::Draining);
        assert!(flag.try_begin().is_none());

        drop(guard);
        assert_eq!(flag.state(), DrainState::Idle);
        assert!(flag.try_begin().is_some());
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = SyncStats::default();
        stats.record(&DrainReport {
            replayed: 2,
            failed: 1,
            ..Default::default()
        });
        stats.record(&DrainReport {
            replayed: 1,
            ..Default::default()
        });

        assert_eq!(stats.cycles, 2);
        assert_eq!(stats.replayed, 3);
        assert_eq!(stats.failed, 1);
        assert!(stats.last_report.unwrap().is_clean());
    }
}
