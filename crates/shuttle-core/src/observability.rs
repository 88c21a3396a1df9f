//! Worker counters.
//!
//! Updated lock-free from every claim loop and execution; read as a
//! serializable snapshot for logs and the final run report.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::ResultKind;

#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    completed: AtomicU64,
    bpmn_errors: AtomicU64,
    failures: AtomicU64,
    incidents: AtomicU64,
    lock_lost: AtomicU64,
    reports_dropped: AtomicU64,
    duplicates_skipped: AtomicU64,
    claim_errors: AtomicU64,
    released: AtomicU64,
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Tasks received from fetch-and-lock.
    pub claimed: u64,
    /// Accepted reports, by kind.
    pub completed: u64,
    pub bpmn_errors: u64,
    pub failures: u64,
    /// Accepted failures that exhausted the retries (subset of `failures`).
    pub incidents: u64,
    /// Reports or lock extensions refused because the lock had moved on.
    pub lock_lost: u64,
    /// Reports given up on after transport errors or rejections.
    pub reports_dropped: u64,
    pub duplicates_skipped: u64,
    pub claim_errors: u64,
    /// Tasks handed back with unlock (shutdown, aborted handlers).
    pub released: u64,
}

impl StatsSnapshot {
    /// Reports the engine accepted.
    pub fn reported(&self) -> u64 {
        self.completed + self.bpmn_errors + self.failures
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_claimed(&self, count: usize) {
        bump(&self.claimed, count as u64);
    }

    /// An accepted report.
    pub fn record_reported(&self, kind: ResultKind, incident: bool) {
        match kind {
            ResultKind::Completed => bump(&self.completed, 1),
            ResultKind::BpmnError => bump(&self.bpmn_errors, 1),
            ResultKind::Failure => {
                bump(&self.failures, 1);
                if incident {
                    bump(&self.incidents, 1);
                }
            }
        }
    }

    pub fn record_lock_lost(&self) {
        bump(&self.lock_lost, 1);
    }

    pub fn record_report_dropped(&self) {
        bump(&self.reports_dropped, 1);
    }

    pub fn record_duplicate_skipped(&self) {
        bump(&self.duplicates_skipped, 1);
    }

    pub fn record_claim_error(&self) {
        bump(&self.claim_errors, 1);
    }

    pub fn record_released(&self) {
        bump(&self.released, 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            claimed: load(&self.claimed),
            completed: load(&self.completed),
            bpmn_errors: load(&self.bpmn_errors),
            failures: load(&self.failures),
            incidents: load(&self.incidents),
            lock_lost: load(&self.lock_lost),
            reports_dropped: load(&self.reports_dropped),
            duplicates_skipped: load(&self.duplicates_skipped),
            claim_errors: load(&self.claim_errors),
            released: load(&self.released),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incidents_are_counted_as_failures_too() {
        let stats = WorkerStats::new();
        stats.record_claimed(3);
        stats.record_reported(ResultKind::Completed, false);
        stats.record_reported(ResultKind::Failure, false);
        stats.record_reported(ResultKind::Failure, true);

        let snap = stats.snapshot();
        assert_eq!(snap.claimed, 3);
        assert_eq!(snap.failures, 2);
        assert_eq!(snap.incidents, 1);
        assert_eq!(snap.reported(), 3);
    }

    #[test]
    fn snapshot_serializes_flat() {
        let stats = WorkerStats::new();
        stats.record_lock_lost();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["lock_lost"], 1);
        assert_eq!(json["claimed"], 0);
    }
}
