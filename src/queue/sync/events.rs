//! Event system for the offline queue.
//!
//! Every state change the engine and facade make is announced as a [`SyncEvent`]. Callers
//! subscribe handlers through the [`EventDispatcher`], either to every event or to one
//! [`EventKind`], and unsubscribe with the returned [`SubscriptionId`].
//!
//! Handlers run in registration order on the task that emitted the event. A failing handler is
//! logged and never stops the remaining handlers, nor the sync cycle that emitted the event.
//! Handlers may call back into the queue (enqueue, resolve, subscribe). Events raised while a
//! handler runs are delivered to every other matching handler, but not back to that handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::Display;
use tokio::sync::Mutex;

use crate::queue::sync::report::SyncCycleReport;
use crate::queue::types::{ActionId, ActionKind, QueuedAction, SyncError};

/// Events emitted by the queue
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A new action was durably recorded
    Queued { action: QueuedAction },
    /// The remote system accepted the action; it is gone from the store
    Synced { action_id: ActionId, kind: ActionKind },
    /// The action is dead-lettered
    Failed { action: QueuedAction, reason: String },
    /// The remote system reported a conflict that needs a decision
    Conflict {
        action: QueuedAction,
        conflict_data: Value,
    },
    /// A registered merge rule settled a conflict and the action is pending again
    ConflictAutoResolved { action_id: ActionId, kind: ActionKind },
    /// The store dropped this record to stay under its size bound
    Evicted { action: QueuedAction },
    /// A conflict was settled by a caller; `requeued` is false when the local action was dropped
    ConflictResolved {
        action_id: ActionId,
        kind: ActionKind,
        requeued: bool,
    },
    /// An operator dropped a failed or conflicted action
    Discarded { action: QueuedAction },
    /// An operator gave a failed action a fresh set of attempts
    Requeued { action_id: ActionId, kind: ActionKind },
    CycleStarted { started_at: DateTime<Utc> },
    CycleCompleted { report: SyncCycleReport },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Queued,
    Synced,
    Failed,
    Conflict,
    ConflictAutoResolved,
    Evicted,
    ConflictResolved,
    Discarded,
    Requeued,
    CycleStarted,
    CycleCompleted,
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Queued { .. } => EventKind::Queued,
            SyncEvent::Synced { .. } => EventKind::Synced,
            SyncEvent::Failed { .. } => EventKind::Failed,
            SyncEvent::Conflict { .. } => EventKind::Conflict,
            SyncEvent::ConflictAutoResolved { .. } => EventKind::ConflictAutoResolved,
            SyncEvent::Evicted { .. } => EventKind::Evicted,
            SyncEvent::ConflictResolved { .. } => EventKind::ConflictResolved,
            SyncEvent::Discarded { .. } => EventKind::Discarded,
            SyncEvent::Requeued { .. } => EventKind::Requeued,
            SyncEvent::CycleStarted { .. } => EventKind::CycleStarted,
            SyncEvent::CycleCompleted { .. } => EventKind::CycleCompleted,
        }
    }
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Adapter so plain closures can be subscribed.
pub struct FnHandler<F> {
    name: &'static str,
    callback: F,
}

impl<F> FnHandler<F>
where
    F: FnMut(&SyncEvent) + Send + Sync,
{
    pub fn new(name: &'static str, callback: F) -> Self {
        Self { name, callback }
    }
}

#[async_trait::async_trait]
impl<F> SyncEventHandler for FnHandler<F>
where
    F: FnMut(&SyncEvent) + Send + Sync,
{
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), SyncError> {
        (self.callback)(event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SharedHandler = Arc<Mutex<Box<dyn SyncEventHandler>>>;

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventKind>,
    handler: SharedHandler,
}

tokio::task_local! {
    /// Subscriptions whose handler is running further up the current call chain.
    static DELIVERING: Vec<SubscriptionId>;
}

/// Event dispatcher that manages multiple event handlers.
pub struct EventDispatcher {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler for one event kind, or for all events when `filter` is `None`.
    pub async fn subscribe(
        &self,
        filter: Option<EventKind>,
        handler: Box<dyn SyncEventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            "Subscribed handler {} to {}",
            handler.name(),
            filter.map_or_else(|| "all events".to_string(), |kind| kind.to_string())
        );
        self.subscriptions.lock().await.push(Subscription {
            id,
            filter,
            handler: Arc::new(Mutex::new(handler)),
        });
        id
    }

    /// Returns `false` if the subscription was already gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock().await;
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Dispatch an event to all matching handlers.
    ///
    /// The subscription list is only locked while matching handlers are collected, so handlers
    /// are free to re-enter the queue. Errors from handlers are logged, but do not stop other
    /// handlers from running.
    pub async fn dispatch(&self, event: &SyncEvent) {
        let kind = event.kind();
        let targets: Vec<(SubscriptionId, SharedHandler)> = self
            .subscriptions
            .lock()
            .await
            .iter()
            .filter(|subscription| subscription.filter.is_none_or(|filter| filter == kind))
            .map(|subscription| (subscription.id, subscription.handler.clone()))
            .collect();
        let delivering = DELIVERING
            .try_with(|delivering| delivering.clone())
            .unwrap_or_default();

        for (id, handler) in targets {
            if delivering.contains(&id) {
                tracing::debug!("Not delivering {} event back to the handler that raised it", kind);
                continue;
            }
            let mut chain = delivering.clone();
            chain.push(id);
            DELIVERING
                .scope(chain, async {
                    let mut handler = handler.lock().await;
                    if let Err(e) = handler.handle(event).await {
                        tracing::error!(
                            "Handler {} failed to process {} event: {}",
                            handler.name(),
                            kind,
                            e
                        );
                    }
                })
                .await;
        }
    }
}
