//! Per-cycle bookkeeping.
//!
//! The [`CycleTracker`] is fed one [`ActionResult`] per action the engine touched during a cycle
//! and turns into the [`SyncCycleReport`] returned to callers and emitted as `cycle_completed`.

use chrono::{DateTime, Utc};
use tracing::info;

use crate::queue::types::QueuedAction;

/// Where one action ended up after a cycle touched it.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionResult {
    Synced,
    /// Transient failure with attempts left; `next_retry_at` is set
    Rescheduled,
    /// Dead-lettered, either permanently rejected or out of attempts
    Failed(QueuedAction),
    Conflicted(QueuedAction),
    /// A merge rule requeued it right away
    AutoResolved,
    /// Another writer changed the record between selection and execution
    Skipped,
}

/// Summary of one sync cycle. Not persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempted: usize,
    pub synced: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub conflicted: usize,
    pub auto_resolved: usize,
    /// Actions left in `Failed` or `Conflict` by this cycle
    pub needs_attention: Vec<QueuedAction>,
}

impl SyncCycleReport {
    /// True when every attempted action either synced or was settled automatically.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.conflicted == 0 && self.rescheduled == 0
    }

    /// Get a human-readable summary of the cycle
    pub fn summary(&self) -> String {
        format!(
            "{} attempted: {} synced, {} rescheduled, {} failed, {} conflicted{}",
            self.attempted,
            self.synced,
            self.rescheduled,
            self.failed,
            self.conflicted,
            if self.auto_resolved == 0 {
                String::new()
            } else {
                format!(" ({} auto-resolved)", self.auto_resolved)
            }
        )
    }
}

/// Accumulates results while a cycle runs
#[derive(Debug, Clone)]
pub(crate) struct CycleTracker {
    started_at: DateTime<Utc>,
    attempted: usize,
    synced: usize,
    rescheduled: usize,
    conflicted: usize,
    auto_resolved: usize,
    failed: usize,
    needs_attention: Vec<QueuedAction>,
}

impl CycleTracker {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            attempted: 0,
            synced: 0,
            rescheduled: 0,
            conflicted: 0,
            auto_resolved: 0,
            failed: 0,
            needs_attention: Vec::new(),
        }
    }

    pub fn record(&mut self, result: ActionResult) {
        if result != ActionResult::Skipped {
            self.attempted += 1;
        }
        match result {
            ActionResult::Synced => self.synced += 1,
            ActionResult::Rescheduled => self.rescheduled += 1,
            ActionResult::AutoResolved => self.auto_resolved += 1,
            ActionResult::Failed(action) => {
                self.failed += 1;
                self.needs_attention.push(action);
            }
            ActionResult::Conflicted(action) => {
                self.conflicted += 1;
                self.needs_attention.push(action);
            }
            ActionResult::Skipped => {}
        }
    }

    pub fn finish(self, finished_at: DateTime<Utc>) -> SyncCycleReport {
        let report = SyncCycleReport {
            started_at: self.started_at,
            finished_at,
            attempted: self.attempted,
            synced: self.synced,
            rescheduled: self.rescheduled,
            failed: self.failed,
            conflicted: self.conflicted,
            auto_resolved: self.auto_resolved,
            needs_attention: self.needs_attention,
        };
        if report.attempted > 0 {
            info!("Sync cycle finished: {}", report.summary());
        }
        report
    }
}
