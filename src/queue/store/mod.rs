//! Durable storage for queued actions.
//!
//! The engine only ever talks to the [`ActionStore`] trait. Two implementations ship with the
//! crate: [`InMemoryActionStore`] for tests and ephemeral hosts, and [`FileActionStore`] which keeps
//! one JSON document per action in a directory and survives process restarts.
//!
//! Both enforce the same two owner rules:
//! - on load, any record left in `Syncing` (the process died mid-execution) is reset to `Pending`;
//! - the record count is bounded, and eviction picks `Synced` records first, then the oldest
//!   `Low`-priority `Pending` ones. `Failed` and `Conflict` records are never evicted.

mod file;
mod memory;

pub use file::FileActionStore;
pub use memory::InMemoryActionStore;

use std::sync::Arc;

use crate::config::StoreConfig;
use crate::queue::types::{ActionId, ActionKind, ActionStatus, Priority, QueuedAction, SyncError};
use tracing::info;

/// Repository for queued action persistence
#[async_trait::async_trait]
pub trait ActionStore: Send + Sync {
    /// Insert or replace a record. Returns the records evicted to make room, if any.
    async fn put(&self, action: &QueuedAction) -> Result<Vec<QueuedAction>, SyncError>;

    async fn get(&self, id: &ActionId) -> Result<Option<QueuedAction>, SyncError>;

    /// Returns `true` if a record was removed.
    async fn delete(&self, id: &ActionId) -> Result<bool, SyncError>;

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<QueuedAction>, SyncError>;
}

/// Open the store described by `config`: file-backed when `data_dir` is set, in-memory otherwise.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ActionStore>, SyncError> {
    match &config.data_dir {
        Some(dir) => Ok(Arc::new(
            FileActionStore::open(dir.clone(), config.max_records).await?,
        )),
        None => {
            info!("No data directory configured, queued actions will not survive a restart");
            Ok(Arc::new(InMemoryActionStore::new(config.max_records)))
        }
    }
}

/// Selection criteria for [`ActionStore::list`]. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionFilter {
    pub statuses: Vec<ActionStatus>,
    pub owner_id: Option<String>,
    pub kind: Option<ActionKind>,
}

impl ActionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(status: ActionStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn with_statuses(statuses: impl IntoIterator<Item = ActionStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn of_kind(mut self, kind: ActionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, action: &QueuedAction) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&action.status))
            && self
                .owner_id
                .as_deref()
                .is_none_or(|owner| owner == action.owner_id)
            && self.kind.is_none_or(|kind| kind == action.kind)
    }
}

/// Decide which records must go so that `incoming` fits under `max_records`.
///
/// Replacing an existing record never grows the store, so nothing is evicted in that case.
pub(crate) fn plan_evictions<'a>(
    existing: impl IntoIterator<Item = &'a QueuedAction>,
    incoming: &QueuedAction,
    max_records: usize,
) -> Result<Vec<ActionId>, SyncError> {
    let existing: Vec<&QueuedAction> = existing.into_iter().collect();
    if existing.iter().any(|action| action.id == incoming.id) {
        return Ok(Vec::new());
    }

    let overflow = (existing.len() + 1).saturating_sub(max_records);
    if overflow == 0 {
        return Ok(Vec::new());
    }

    let mut synced: Vec<&QueuedAction> = existing
        .iter()
        .copied()
        .filter(|action| action.status == ActionStatus::Synced)
        .collect();
    synced.sort_by_key(|action| action.created_at);

    let mut stale_low: Vec<&QueuedAction> = existing
        .iter()
        .copied()
        .filter(|action| {
            action.status == ActionStatus::Pending && action.priority == Priority::Low
        })
        .collect();
    stale_low.sort_by_key(|action| (action.created_at, action.id));

    let victims: Vec<ActionId> = synced
        .into_iter()
        .chain(stale_low)
        .take(overflow)
        .map(|action| action.id)
        .collect();

    if victims.len() < overflow {
        return Err(SyncError::StoreFull { max_records });
    }
    Ok(victims)
}

/// Apply the crash-recovery rule to freshly loaded records. Returns how many were reset.
pub(crate) fn recover_interrupted<'a>(
    records: impl IntoIterator<Item = &'a mut QueuedAction>,
) -> usize {
    let mut recovered = 0;
    for record in records {
        if record.recover_interrupted() {
            info!(
                "Recovered action {} ({}) left in syncing state, reset to pending",
                record.id, record.kind
            );
            recovered += 1;
        }
    }
    recovered
}
