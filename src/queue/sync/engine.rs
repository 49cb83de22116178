//! Sync engine: drains due actions and routes every outcome into persisted state.
//!
//! The engine owns two locks:
//! - the cycle lock, held for the whole draining phase, so at most one cycle runs at a time and
//!   no two cycles can claim the same `Pending` action. A cycle requested while another is running
//!   returns immediately with `None`;
//! - the transition lock, held for each read-modify-write of a single record, so enqueue, cycle
//!   transitions and conflict resolution never interleave their updates to one record.
//!
//! Remote failures never escape a cycle. Each one becomes a persisted status plus an event, and
//! the cycle always finishes with a [`SyncCycleReport`]. An executor that panics is treated as a
//! transient failure.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use itertools::Itertools;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::queue::store::{ActionFilter, ActionStore};
use crate::queue::sync::{
    conflict::{ConflictResolver, Resolution, ResolutionStrategy},
    events::{EventDispatcher, SyncEvent},
    executor::{ExecutorRegistry, Outcome},
    report::{ActionResult, CycleTracker, SyncCycleReport},
    retry::RetryPolicy,
};
use crate::queue::types::{
    ActionId, ActionKind, ActionStatus, EnqueueOptions, QueuedAction, StatusCounts, SyncError,
    SyncResult, queue_order,
};
use crate::utils::Clock;

/// Result of [`SyncEngine::insert`].
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    pub id: ActionId,
    /// `false` when an existing live record with the same idempotency key was returned instead
    pub created: bool,
}

pub struct SyncEngine {
    store: Arc<dyn ActionStore>,
    executors: ExecutorRegistry,
    resolver: ConflictResolver,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<EventDispatcher>,
    max_concurrency: usize,

    cycle_lock: Mutex<()>,
    transition_lock: Mutex<()>,
    in_progress: AtomicBool,
    last_cycle_at: StdMutex<Option<DateTime<Utc>>>,
}

/// Clears the in-progress flag however the cycle ends.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ActionStore>,
        executors: ExecutorRegistry,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            store,
            executors,
            resolver: ConflictResolver::new(),
            retry_policy: RetryPolicy::default(),
            clock,
            dispatcher,
            max_concurrency: 1,
            cycle_lock: Mutex::new(()),
            transition_lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            last_cycle_at: StdMutex::new(None),
        }
    }

    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ActionStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn is_cycle_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        *self.last_cycle_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one sync cycle, or return `None` if one is already running.
    pub async fn run_cycle(&self) -> SyncResult<Option<SyncCycleReport>> {
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("Sync cycle already in progress, skipping trigger");
            return Ok(None);
        };
        self.in_progress.store(true, Ordering::Release);
        let _in_progress = InProgressGuard(&self.in_progress);

        let started_at = self.clock.now();
        let due = self.select_due(started_at).await?;

        self.dispatcher
            .dispatch(&SyncEvent::CycleStarted { started_at })
            .await;
        if !due.is_empty() {
            info!(
                "Starting sync cycle with {} due actions (concurrency {})",
                due.len(),
                self.max_concurrency
            );
        }

        let results: Vec<ActionResult> = futures::stream::iter(due)
            .map(|action| self.process_action(action))
            .buffered(self.max_concurrency)
            .collect()
            .await;

        let mut tracker = CycleTracker::new(started_at);
        for result in results {
            tracker.record(result);
        }

        let finished_at = self.clock.now();
        let report = tracker.finish(finished_at);
        *self.last_cycle_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(finished_at);

        self.dispatcher
            .dispatch(&SyncEvent::CycleCompleted {
                report: report.clone(),
            })
            .await;
        Ok(Some(report))
    }

    /// Pending actions whose retry time is unset or elapsed, in drain order.
    async fn select_due(&self, now: DateTime<Utc>) -> SyncResult<Vec<QueuedAction>> {
        Ok(self
            .store
            .list(&ActionFilter::with_status(ActionStatus::Pending))
            .await?
            .into_iter()
            .filter(|action| action.is_due(now))
            .sorted_by(queue_order)
            .collect())
    }

    /// Whether any pending action is waiting on a retry time that has now elapsed.
    pub async fn has_due_retries(&self) -> SyncResult<bool> {
        let now = self.clock.now();
        Ok(self
            .store
            .list(&ActionFilter::with_status(ActionStatus::Pending))
            .await?
            .iter()
            .any(|action| action.next_retry_at.is_some_and(|at| at <= now)))
    }

    async fn process_action(&self, selected: QueuedAction) -> ActionResult {
        let id = selected.id;
        let claimed = match self.claim(id).await {
            Ok(Some(action)) => action,
            Ok(None) => {
                debug!("Action {} is no longer due, skipping", id);
                return ActionResult::Skipped;
            }
            Err(e) => {
                error!("Failed to claim action {}: {}", id, e);
                return ActionResult::Skipped;
            }
        };

        let outcome = match AssertUnwindSafe(self.executors.execute(&claimed))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("Executor panicked on action {} ({}): {}", id, claimed.kind, reason);
                Outcome::TransientFailure(format!("Executor panicked: {}", reason))
            }
        };
        debug!("Action {} ({}) returned {}", id, claimed.kind, outcome.name());

        match self.apply_outcome(claimed, outcome).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to persist outcome for action {}: {}", id, e);
                self.release(id).await;
                ActionResult::Skipped
            }
        }
    }

    /// Re-read the record and move it to `Syncing` if it is still due.
    async fn claim(&self, id: ActionId) -> SyncResult<Option<QueuedAction>> {
        let _record = self.transition_lock.lock().await;
        let now = self.clock.now();
        let Some(mut action) = self.store.get(&id).await? else {
            return Ok(None);
        };
        if !action.is_due(now) {
            return Ok(None);
        }
        action.mark_syncing(now);
        self.store.put(&action).await?;
        Ok(Some(action))
    }

    /// Best effort: put a record we could not settle back in line.
    async fn release(&self, id: ActionId) {
        let _record = self.transition_lock.lock().await;
        match self.store.get(&id).await {
            Ok(Some(mut action)) if action.status == ActionStatus::Syncing => {
                action.recover_interrupted();
                if let Err(e) = self.store.put(&action).await {
                    warn!("Action {} stays in syncing until restart: {}", id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Action {} stays in syncing until restart: {}", id, e),
        }
    }

    async fn apply_outcome(
        &self,
        mut action: QueuedAction,
        outcome: Outcome,
    ) -> SyncResult<ActionResult> {
        let (result, event) = {
            let _record = self.transition_lock.lock().await;
            match outcome {
                Outcome::Success => {
                    action.mark_synced();
                    self.store.put(&action).await?;
                    self.store.delete(&action.id).await?;
                    info!("Action {} ({}) synced", action.id, action.kind);
                    (
                        ActionResult::Synced,
                        SyncEvent::Synced {
                            action_id: action.id,
                            kind: action.kind,
                        },
                    )
                }
                Outcome::Conflict(conflict_data) => {
                    self.settle_conflict(action, conflict_data).await?
                }
                Outcome::TransientFailure(reason) => {
                    let attempt = action.register_attempt();
                    if self.retry_policy.should_retry(attempt, action.max_attempts) {
                        let delay = self.retry_policy.next_delay(attempt);
                        let retry_at = retry_time(self.clock.now(), delay);
                        warn!(
                            "Action {} ({}) failed (attempt {}/{}): {}; retrying at {}",
                            action.id, action.kind, attempt, action.max_attempts, reason, retry_at
                        );
                        action.schedule_retry(retry_at, reason);
                        self.store.put(&action).await?;
                        return Ok(ActionResult::Rescheduled);
                    }

                    let reason = format!("Gave up after {} attempts: {}", attempt, reason);
                    self.dead_letter(action, reason).await?
                }
                Outcome::PermanentFailure(reason) => {
                    action.register_attempt();
                    self.dead_letter(action, reason).await?
                }
            }
        };

        self.dispatcher.dispatch(&event).await;
        Ok(result)
    }

    async fn settle_conflict(
        &self,
        mut action: QueuedAction,
        conflict_data: Value,
    ) -> SyncResult<(ActionResult, SyncEvent)> {
        if let Some(Resolution::RetryWithPayload { payload, force }) =
            self.resolver.auto_resolve(&action, &conflict_data)
        {
            action.requeue(payload, force);
            self.store.put(&action).await?;
            info!(
                "Conflict on action {} ({}) settled by merge rule, requeued",
                action.id, action.kind
            );
            return Ok((
                ActionResult::AutoResolved,
                SyncEvent::ConflictAutoResolved {
                    action_id: action.id,
                    kind: action.kind,
                },
            ));
        }

        action.mark_conflict(conflict_data.clone());
        self.store.put(&action).await?;
        warn!(
            "Action {} ({}) conflicts with server state, awaiting resolution",
            action.id, action.kind
        );
        Ok((
            ActionResult::Conflicted(action.clone()),
            SyncEvent::Conflict {
                action,
                conflict_data,
            },
        ))
    }

    async fn dead_letter(
        &self,
        mut action: QueuedAction,
        reason: String,
    ) -> SyncResult<(ActionResult, SyncEvent)> {
        action.mark_failed(reason.clone());
        self.store.put(&action).await?;
        error!("Action {} ({}) failed: {}", action.id, action.kind, reason);
        Ok((
            ActionResult::Failed(action.clone()),
            SyncEvent::Failed { action, reason },
        ))
    }

    /// Durably record a new `Pending` action, or return the live record that already carries the
    /// same owner and idempotency key.
    pub async fn insert(
        &self,
        kind: ActionKind,
        payload: Value,
        options: EnqueueOptions,
        default_max_attempts: u32,
    ) -> SyncResult<Inserted> {
        let max_attempts = options.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts == 0 {
            return Err(SyncError::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let (action, evicted) = {
            let _record = self.transition_lock.lock().await;

            if let Some(key) = options.idempotency_key.as_deref() {
                let existing = self
                    .store
                    .list(&ActionFilter::all().owned_by(options.owner_id.clone()))
                    .await?
                    .into_iter()
                    .find(|action| action.is_same_intent(&options.owner_id, key));
                if let Some(existing) = existing {
                    debug!(
                        "Idempotency key {:?} already queued as action {}",
                        key, existing.id
                    );
                    return Ok(Inserted {
                        id: existing.id,
                        created: false,
                    });
                }
            }

            let action =
                QueuedAction::new(kind, payload, options, max_attempts, self.clock.now());
            let evicted = self.store.put(&action).await?;
            (action, evicted)
        };

        info!(
            "Queued action {} ({}, {:?} priority)",
            action.id, action.kind, action.priority
        );
        for record in evicted {
            self.dispatcher
                .dispatch(&SyncEvent::Evicted { action: record })
                .await;
        }
        let id = action.id;
        self.dispatcher
            .dispatch(&SyncEvent::Queued { action })
            .await;
        Ok(Inserted { id, created: true })
    }

    /// Apply a resolution to an action in `Conflict`. Returns `false`, touching nothing, for any
    /// other status or an unknown id.
    pub async fn resolve_conflict(
        &self,
        id: &ActionId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<bool> {
        let event = {
            let _record = self.transition_lock.lock().await;
            let Some(mut action) = self.store.get(id).await? else {
                return Ok(false);
            };
            if action.status != ActionStatus::Conflict {
                return Ok(false);
            }

            let strategy_name = strategy.name();
            let conflict_data = action.conflict_data.clone().unwrap_or(Value::Null);
            let requeued = match self.resolver.resolve(&action, &conflict_data, strategy) {
                Resolution::Discard => {
                    self.store.delete(id).await?;
                    info!(
                        "Conflict on action {} ({}) resolved with {}, local action discarded",
                        id, action.kind, strategy_name
                    );
                    false
                }
                Resolution::RetryWithPayload { payload, force } => {
                    action.requeue(payload, force);
                    self.store.put(&action).await?;
                    info!(
                        "Conflict on action {} ({}) resolved with {}, requeued",
                        id, action.kind, strategy_name
                    );
                    true
                }
            };
            SyncEvent::ConflictResolved {
                action_id: action.id,
                kind: action.kind,
                requeued,
            }
        };
        self.dispatcher.dispatch(&event).await;
        Ok(true)
    }

    /// Operator discard of a dead-lettered or conflicted record.
    pub async fn discard(&self, id: &ActionId) -> SyncResult<bool> {
        let action = {
            let _record = self.transition_lock.lock().await;
            match self.store.get(id).await? {
                Some(action) if action.status.needs_attention() => {
                    self.store.delete(id).await?;
                    info!(
                        "Discarded {} action {} ({})",
                        action.status, id, action.kind
                    );
                    action
                }
                _ => return Ok(false),
            }
        };
        self.dispatcher
            .dispatch(&SyncEvent::Discarded { action })
            .await;
        Ok(true)
    }

    /// Give a dead-lettered action a fresh set of attempts.
    pub async fn retry_failed(&self, id: &ActionId) -> SyncResult<bool> {
        let kind = {
            let _record = self.transition_lock.lock().await;
            match self.store.get(id).await? {
                Some(mut action) if action.status == ActionStatus::Failed => {
                    let payload = action.payload.clone();
                    let force = action.force;
                    action.requeue(payload, force);
                    self.store.put(&action).await?;
                    info!("Requeued failed action {} ({})", id, action.kind);
                    action.kind
                }
                _ => return Ok(false),
            }
        };
        self.dispatcher
            .dispatch(&SyncEvent::Requeued {
                action_id: *id,
                kind,
            })
            .await;
        Ok(true)
    }

    pub async fn counts(&self, filter: &ActionFilter) -> SyncResult<StatusCounts> {
        let actions = self.store.list(filter).await?;
        Ok(StatusCounts::from_actions(&actions))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn retry_time(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::store::InMemoryActionStore;
    use crate::queue::types::Priority;
    use crate::test_support::{ScriptedExecutor, test_engine};
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn enqueue(engine: &SyncEngine, kind: ActionKind, options: EnqueueOptions) -> ActionId {
        engine
            .insert(kind, json!({"n": 1}), options, 3)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn success_removes_action_from_store() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        let id = enqueue(&engine, ActionKind::Vote, EnqueueOptions::default()).await;

        let report = engine.run_cycle().await.unwrap().unwrap();

        assert_eq!(report.synced, 1);
        assert_eq!(store.get(&id).await.unwrap(), None);
        assert_eq!(executor.calls(), vec![id]);
    }

    #[tokio::test]
    async fn cycle_follows_priority_then_age() {
        let executor = ScriptedExecutor::new();
        let (engine, _store, clock) = test_engine(executor.clone());

        let c = enqueue(
            &engine,
            ActionKind::Comment,
            EnqueueOptions::default().with_priority(Priority::Normal),
        )
        .await;
        clock.advance(Duration::seconds(1));
        let a = enqueue(
            &engine,
            ActionKind::Reaction,
            EnqueueOptions::default().with_priority(Priority::Low),
        )
        .await;
        clock.advance(Duration::seconds(1));
        let b = enqueue(
            &engine,
            ActionKind::Tip,
            EnqueueOptions::default().with_priority(Priority::High),
        )
        .await;

        engine.run_cycle().await.unwrap();
        assert_eq!(executor.calls(), vec![b, c, a]);
    }

    #[tokio::test]
    async fn transient_failure_schedules_retry_then_dead_letters() {
        let executor = ScriptedExecutor::new();
        let (engine, store, clock) = test_engine(executor.clone());
        executor.push_many(
            ActionKind::Tip,
            std::iter::repeat_n(Outcome::TransientFailure("HTTP 503".to_string()), 3),
        );
        let id = enqueue(&engine, ActionKind::Tip, EnqueueOptions::default()).await;

        for attempt in 1..=2 {
            let report = engine.run_cycle().await.unwrap().unwrap();
            assert_eq!(report.rescheduled, 1);
            let action = store.get(&id).await.unwrap().unwrap();
            assert_eq!(action.status, ActionStatus::Pending);
            assert_eq!(action.attempt_count, attempt);
            let retry_at = action.next_retry_at.unwrap();
            assert!(retry_at > clock.now());

            // Not due yet: a cycle right now leaves it alone.
            engine.run_cycle().await.unwrap();
            assert_eq!(executor.calls().len(), attempt as usize);

            clock.set(retry_at);
        }

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.attempt_count, 3);
        assert_eq!(action.next_retry_at, None);

        clock.advance(Duration::days(1));
        engine.run_cycle().await.unwrap();
        assert_eq!(executor.calls().len(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        executor.push(
            ActionKind::CreatePost,
            Outcome::PermanentFailure("title required (422)".to_string()),
        );
        let id = enqueue(&engine, ActionKind::CreatePost, EnqueueOptions::default()).await;

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.needs_attention[0].id, id);

        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.last_error.as_deref(), Some("title required (422)"));
    }

    #[tokio::test]
    async fn conflict_never_consumes_attempts() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        executor.push(ActionKind::Vote, Outcome::Conflict(json!({"serverChoice": "no"})));
        let id = enqueue(&engine, ActionKind::Vote, EnqueueOptions::default()).await;

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.conflicted, 1);

        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Conflict);
        assert_eq!(action.attempt_count, 0);
        assert_eq!(action.next_retry_at, None);
        assert_eq!(action.conflict_data, Some(json!({"serverChoice": "no"})));

        // Conflicts are not retried automatically.
        engine.run_cycle().await.unwrap();
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn failure_does_not_block_later_actions() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        executor.push(ActionKind::Tip, Outcome::TransientFailure("timeout".to_string()));
        let tip = enqueue(
            &engine,
            ActionKind::Tip,
            EnqueueOptions::default().with_priority(Priority::High),
        )
        .await;
        let follow = enqueue(
            &engine,
            ActionKind::Follow,
            EnqueueOptions::default().with_priority(Priority::Low),
        )
        .await;

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(executor.calls(), vec![tip, follow]);
        assert!(store.get(&follow).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_rule_requeues_conflicts() {
        let executor = ScriptedExecutor::new();
        let store = Arc::new(InMemoryActionStore::new(100));
        let clock = Arc::new(crate::utils::ManualClock::new(Utc::now()));
        let engine = SyncEngine::new(
            store.clone(),
            ExecutorRegistry::uniform(Arc::new(executor.clone())),
            clock,
            Arc::new(EventDispatcher::new()),
        )
        .with_resolver(ConflictResolver::new().with_rule(
            ActionKind::Reaction,
            |_: &Value, server: &Value| Some(json!({"emoji": server["emoji"].clone()})),
        ));
        executor.push(ActionKind::Reaction, Outcome::Conflict(json!({"emoji": "+1"})));
        let id = enqueue(&engine, ActionKind::Reaction, EnqueueOptions::default()).await;

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.auto_resolved, 1);
        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.payload, json!({"emoji": "+1"}));

        engine.run_cycle().await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotency_key_returns_existing_live_record() {
        let (engine, store, _clock) = test_engine(ScriptedExecutor::new());
        let options = EnqueueOptions::for_owner("user-1").with_idempotency_key("vote:p1");

        let first = engine
            .insert(ActionKind::Vote, json!({"choice": "yes"}), options.clone(), 3)
            .await
            .unwrap();
        let second = engine
            .insert(ActionKind::Vote, json!({"choice": "yes"}), options, 3)
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.snapshot().await.len(), 1);

        let other_owner = engine
            .insert(
                ActionKind::Vote,
                json!({"choice": "yes"}),
                EnqueueOptions::for_owner("user-2").with_idempotency_key("vote:p1"),
                3,
            )
            .await
            .unwrap();
        assert!(other_owner.created);
    }

    #[tokio::test]
    async fn insert_rejects_zero_attempts() {
        let (engine, _store, _clock) = test_engine(ScriptedExecutor::new());
        let err = engine
            .insert(
                ActionKind::Vote,
                json!({}),
                EnqueueOptions::default().with_max_attempts(0),
                3,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn resolve_conflict_only_applies_to_conflicts() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        let pending = enqueue(&engine, ActionKind::Comment, EnqueueOptions::default()).await;
        let before = store.get(&pending).await.unwrap();

        assert!(
            !engine
                .resolve_conflict(&pending, ResolutionStrategy::ServerWins)
                .await
                .unwrap()
        );
        assert_eq!(store.get(&pending).await.unwrap(), before);
        assert!(
            !engine
                .resolve_conflict(&ActionId::new(), ResolutionStrategy::ClientWins)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn client_wins_requeues_with_force() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        executor.push(ActionKind::Vote, Outcome::Conflict(json!({"serverChoice": "no"})));
        let id = enqueue(&engine, ActionKind::Vote, EnqueueOptions::default()).await;
        engine.run_cycle().await.unwrap();

        assert!(
            engine
                .resolve_conflict(&id, ResolutionStrategy::ClientWins)
                .await
                .unwrap()
        );
        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert!(action.force);
        assert_eq!(action.conflict_data, None);

        engine.run_cycle().await.unwrap();
        assert_eq!(executor.forced_calls(), vec![id]);
    }

    #[tokio::test]
    async fn discard_and_retry_failed_need_the_right_status() {
        let executor = ScriptedExecutor::new();
        let (engine, store, _clock) = test_engine(executor.clone());
        executor.push(ActionKind::Follow, Outcome::PermanentFailure("404".to_string()));
        executor.push(ActionKind::Unfollow, Outcome::PermanentFailure("404".to_string()));
        let retried = enqueue(&engine, ActionKind::Follow, EnqueueOptions::default()).await;
        let discarded = enqueue(&engine, ActionKind::Unfollow, EnqueueOptions::default()).await;
        let pending = enqueue(&engine, ActionKind::Tip, EnqueueOptions::default()).await;
        engine.run_cycle().await.unwrap();

        let pending_after = engine
            .insert(ActionKind::Tip, json!({}), EnqueueOptions::default(), 3)
            .await
            .unwrap()
            .id;
        assert!(!engine.discard(&pending_after).await.unwrap());
        assert!(!engine.retry_failed(&pending_after).await.unwrap());
        assert!(store.get(&pending).await.unwrap().is_none());

        assert!(engine.discard(&discarded).await.unwrap());
        assert!(store.get(&discarded).await.unwrap().is_none());

        assert!(engine.retry_failed(&retried).await.unwrap());
        let action = store.get(&retried).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.attempt_count, 0);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_a_no_op() {
        let executor = ScriptedExecutor::new().with_delay(std::time::Duration::from_millis(50));
        let (engine, _store, _clock) = test_engine(executor.clone());
        enqueue(&engine, ActionKind::Vote, EnqueueOptions::default()).await;

        let (first, second) = tokio::join!(engine.run_cycle(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            assert!(engine.is_cycle_in_progress());
            engine.run_cycle().await
        });

        assert!(first.unwrap().is_some());
        assert!(second.unwrap().is_none());
        assert_eq!(executor.calls().len(), 1);
        assert!(!engine.is_cycle_in_progress());
        assert!(engine.last_cycle_at().is_some());
    }

    #[tokio::test]
    async fn concurrent_pool_starts_in_selection_order() {
        let executor = ScriptedExecutor::new();
        let store = Arc::new(InMemoryActionStore::new(100));
        let clock = Arc::new(crate::utils::ManualClock::new(Utc::now()));
        let engine = SyncEngine::new(
            store.clone(),
            ExecutorRegistry::uniform(Arc::new(executor.clone())),
            clock.clone(),
            Arc::new(EventDispatcher::new()),
        )
        .with_max_concurrency(3);

        let mut expected = Vec::new();
        for _ in 0..5 {
            expected.push(enqueue(&engine, ActionKind::SendMessage, EnqueueOptions::default()).await);
            clock.advance(Duration::seconds(1));
        }

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.synced, 5);
        assert_eq!(executor.calls(), expected);
        assert!(store.snapshot().await.is_empty());
    }

    struct PanickingExecutor;

    #[async_trait::async_trait]
    impl crate::queue::sync::ActionExecutor for PanickingExecutor {
        async fn execute(&self, _action: &QueuedAction) -> Outcome {
            panic!("backend client bug");
        }

        fn name(&self) -> &'static str {
            "PanickingExecutor"
        }
    }

    #[tokio::test]
    async fn executor_panic_is_a_transient_failure() {
        let store = Arc::new(InMemoryActionStore::new(100));
        let clock = Arc::new(crate::utils::ManualClock::new(Utc::now()));
        let dispatcher = Arc::new(EventDispatcher::new());
        let engine = SyncEngine::new(
            store.clone(),
            ExecutorRegistry::uniform(Arc::new(PanickingExecutor)),
            clock.clone(),
            dispatcher.clone(),
        );
        let completed = Arc::new(StdMutex::new(0));
        let counter = completed.clone();
        dispatcher
            .subscribe(
                Some(crate::queue::sync::EventKind::CycleCompleted),
                Box::new(crate::queue::sync::FnHandler::new("completed", move |_| {
                    *counter.lock().unwrap() += 1;
                })),
            )
            .await;
        let id = enqueue(&engine, ActionKind::Tip, EnqueueOptions::default()).await;

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(*completed.lock().unwrap(), 1);
        assert!(!engine.is_cycle_in_progress());

        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.attempt_count, 1);
        assert!(action.next_retry_at.is_some());
        assert_eq!(
            action.last_error.as_deref(),
            Some("Executor panicked: backend client bug")
        );
    }

    /// Store that refuses to persist conflicts.
    struct ConflictRejectingStore {
        inner: InMemoryActionStore,
    }

    #[async_trait::async_trait]
    impl ActionStore for ConflictRejectingStore {
        async fn put(&self, action: &QueuedAction) -> Result<Vec<QueuedAction>, SyncError> {
            if action.status == ActionStatus::Conflict {
                return Err(SyncError::Store("disk full".to_string()));
            }
            self.inner.put(action).await
        }

        async fn get(&self, id: &ActionId) -> Result<Option<QueuedAction>, SyncError> {
            self.inner.get(id).await
        }

        async fn delete(&self, id: &ActionId) -> Result<bool, SyncError> {
            self.inner.delete(id).await
        }

        async fn list(&self, filter: &ActionFilter) -> Result<Vec<QueuedAction>, SyncError> {
            self.inner.list(filter).await
        }
    }

    #[tokio::test]
    async fn unsettled_outcome_puts_action_back_in_line() {
        let executor = ScriptedExecutor::new();
        executor.push(ActionKind::Vote, Outcome::Conflict(json!({"serverChoice": "no"})));
        let store = Arc::new(ConflictRejectingStore {
            inner: InMemoryActionStore::new(100),
        });
        let engine = SyncEngine::new(
            store.clone(),
            ExecutorRegistry::uniform(Arc::new(executor.clone())),
            Arc::new(crate::utils::ManualClock::new(Utc::now())),
            Arc::new(EventDispatcher::new()),
        );
        let id = enqueue(&engine, ActionKind::Vote, EnqueueOptions::default()).await;

        let report = engine.run_cycle().await.unwrap().unwrap();
        assert_eq!(report.conflicted, 0);
        assert_eq!(report.attempted, 0);

        let action = store.get(&id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.attempt_count, 0);

        // Back in line, so the next cycle sends it again.
        engine.run_cycle().await.unwrap();
        assert_eq!(executor.calls(), vec![id, id]);
    }

    #[tokio::test]
    async fn operator_actions_are_announced() {
        let executor = ScriptedExecutor::new();
        let (engine, _store, _clock) = test_engine(executor.clone());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        engine
            .dispatcher()
            .subscribe(
                None,
                Box::new(crate::queue::sync::FnHandler::new(
                    "operator",
                    move |event: &SyncEvent| {
                        if matches!(
                            event,
                            SyncEvent::ConflictResolved { .. }
                                | SyncEvent::Discarded { .. }
                                | SyncEvent::Requeued { .. }
                        ) {
                            sink.lock().unwrap().push(event.clone());
                        }
                    },
                )),
            )
            .await;

        executor.push(ActionKind::Vote, Outcome::Conflict(json!({"serverChoice": "no"})));
        executor.push(ActionKind::Comment, Outcome::Conflict(json!({"deleted": true})));
        executor.push(ActionKind::Follow, Outcome::PermanentFailure("404".to_string()));
        let vote = enqueue(&engine, ActionKind::Vote, EnqueueOptions::default()).await;
        let comment = enqueue(&engine, ActionKind::Comment, EnqueueOptions::default()).await;
        let follow = enqueue(&engine, ActionKind::Follow, EnqueueOptions::default()).await;
        engine.run_cycle().await.unwrap();

        assert!(
            engine
                .resolve_conflict(&vote, ResolutionStrategy::ClientWins)
                .await
                .unwrap()
        );
        assert!(
            engine
                .resolve_conflict(&comment, ResolutionStrategy::ServerWins)
                .await
                .unwrap()
        );
        assert!(engine.retry_failed(&follow).await.unwrap());
        engine.run_cycle().await.unwrap();
        executor.push(ActionKind::Follow, Outcome::PermanentFailure("404".to_string()));
        let follow_again = enqueue(&engine, ActionKind::Follow, EnqueueOptions::default()).await;
        engine.run_cycle().await.unwrap();
        assert!(engine.discard(&follow_again).await.unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(
            seen[0],
            SyncEvent::ConflictResolved {
                action_id: vote,
                kind: ActionKind::Vote,
                requeued: true,
            }
        );
        assert_eq!(
            seen[1],
            SyncEvent::ConflictResolved {
                action_id: comment,
                kind: ActionKind::Comment,
                requeued: false,
            }
        );
        assert_eq!(
            seen[2],
            SyncEvent::Requeued {
                action_id: follow,
                kind: ActionKind::Follow,
            }
        );
        match &seen[3] {
            SyncEvent::Discarded { action } => {
                assert_eq!(action.id, follow_again);
                assert_eq!(action.status, ActionStatus::Failed);
            }
            other => panic!("expected a discard event, got {:?}", other),
        }
    }
}
