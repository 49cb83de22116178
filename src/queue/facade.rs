//! Public facade over the store, engine and scheduler.
//!
//! [`OfflineQueue`] is the only surface a host needs: it records intents with
//! [`enqueue`](OfflineQueue::enqueue), reports [`status`](OfflineQueue::status), resolves conflicts,
//! exposes event subscription and owns the scheduler lifecycle. Connectivity is pushed in by the
//! host through [`set_online`](OfflineQueue::set_online).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::SyncConfig;
use crate::queue::store::{ActionFilter, ActionStore};
use crate::queue::sync::{
    ConflictResolver, Connectivity, EventDispatcher, EventKind, ExecutorRegistry,
    ResolutionStrategy, RetryPolicy, Scheduler, SchedulerConfig, SchedulerHandle,
    SubscriptionId, SyncCycleReport, SyncEngine, SyncEventHandler, SyncTrigger,
};
use crate::queue::types::{
    ActionId, ActionKind, ActionStatus, EnqueueOptions, QueueStatus, QueuedAction, SyncError,
    SyncResult, queue_order,
};
use crate::utils::{Clock, SystemClock};

pub struct OfflineQueue {
    engine: Arc<SyncEngine>,
    connectivity: Connectivity,
    trigger: StdMutex<SyncTrigger>,
    scheduler_config: SchedulerConfig,
    default_max_attempts: u32,
    scheduler: Mutex<Option<SchedulerHandle>>,
}

pub struct OfflineQueueBuilder {
    store: Arc<dyn ActionStore>,
    executors: ExecutorRegistry,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
    online: bool,
}

impl OfflineQueueBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Initial connectivity; offline unless set.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn build(self) -> SyncResult<OfflineQueue> {
        self.config.validate()?;

        let engine = SyncEngine::new(
            self.store,
            self.executors,
            self.clock,
            Arc::new(EventDispatcher::new()),
        )
        .with_resolver(self.resolver)
        .with_retry_policy(RetryPolicy::from(&self.config.retry))
        .with_max_concurrency(self.config.max_concurrency);

        // No scheduler yet, so requests go nowhere until `start`.
        let (trigger, _) = SyncTrigger::channel();

        Ok(OfflineQueue {
            engine: Arc::new(engine),
            connectivity: Connectivity::new(self.online),
            trigger: StdMutex::new(trigger),
            scheduler_config: SchedulerConfig {
                sync_interval: self.config.sync_interval(),
                retry_check_interval: self.config.retry_check_interval(),
            },
            default_max_attempts: self.config.default_max_attempts,
            scheduler: Mutex::new(None),
        })
    }
}

impl OfflineQueue {
    pub fn builder(store: Arc<dyn ActionStore>, executors: ExecutorRegistry) -> OfflineQueueBuilder {
        OfflineQueueBuilder {
            store,
            executors,
            config: SyncConfig::default(),
            clock: Arc::new(SystemClock),
            resolver: ConflictResolver::new(),
            online: false,
        }
    }

    /// Durably record an intent and return its id.
    ///
    /// With an idempotency key that matches a live record of the same owner, the existing id is
    /// returned and nothing is written. When online, a cycle is requested without waiting for it.
    pub async fn enqueue(
        &self,
        kind: ActionKind,
        payload: Value,
        options: EnqueueOptions,
    ) -> SyncResult<ActionId> {
        let inserted = self
            .engine
            .insert(kind, payload, options, self.default_max_attempts)
            .await?;
        if inserted.created {
            self.request_cycle();
        }
        Ok(inserted.id)
    }

    /// Run a cycle now and wait for its report. `None` means a cycle was already running.
    pub async fn force_sync(&self) -> SyncResult<Option<SyncCycleReport>> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.engine.run_cycle().await
    }

    pub async fn status(&self) -> SyncResult<QueueStatus> {
        self.status_matching(&ActionFilter::all()).await
    }

    /// Same as [`status`](Self::status), counting only the records of one owner.
    pub async fn status_for(&self, owner_id: &str) -> SyncResult<QueueStatus> {
        self.status_matching(&ActionFilter::all().owned_by(owner_id))
            .await
    }

    async fn status_matching(&self, filter: &ActionFilter) -> SyncResult<QueueStatus> {
        Ok(QueueStatus {
            counts: self.engine.counts(filter).await?,
            online: self.is_online(),
            cycle_in_progress: self.engine.is_cycle_in_progress(),
            last_cycle_at: self.engine.last_cycle_at(),
        })
    }

    /// Settle an action in `Conflict`. Returns `false`, changing nothing, for any other id.
    pub async fn resolve_conflict(
        &self,
        id: &ActionId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<bool> {
        let requeues = !matches!(strategy, ResolutionStrategy::ServerWins);
        let resolved = self.engine.resolve_conflict(id, strategy).await?;
        if resolved && requeues {
            self.request_cycle();
        }
        Ok(resolved)
    }

    /// Drop a `Failed` or `Conflict` record. Returns `false` for any other status.
    pub async fn discard(&self, id: &ActionId) -> SyncResult<bool> {
        self.engine.discard(id).await
    }

    /// Requeue a `Failed` record with a fresh attempt budget.
    pub async fn retry_failed(&self, id: &ActionId) -> SyncResult<bool> {
        let requeued = self.engine.retry_failed(id).await?;
        if requeued {
            self.request_cycle();
        }
        Ok(requeued)
    }

    /// Every record waiting on an operator, in drain order.
    pub async fn attention(&self) -> SyncResult<Vec<QueuedAction>> {
        let mut actions = self
            .list(&ActionFilter::with_statuses([
                ActionStatus::Failed,
                ActionStatus::Conflict,
            ]))
            .await?;
        actions.sort_by(queue_order);
        Ok(actions)
    }

    pub async fn get(&self, id: &ActionId) -> SyncResult<Option<QueuedAction>> {
        self.engine.store().get(id).await
    }

    pub async fn list(&self, filter: &ActionFilter) -> SyncResult<Vec<QueuedAction>> {
        self.engine.store().list(filter).await
    }

    /// Subscribe to one kind of event.
    pub async fn on(
        &self,
        kind: EventKind,
        handler: impl SyncEventHandler + 'static,
    ) -> SubscriptionId {
        self.engine
            .dispatcher()
            .subscribe(Some(kind), Box::new(handler))
            .await
    }

    pub async fn on_all(&self, handler: impl SyncEventHandler + 'static) -> SubscriptionId {
        self.engine
            .dispatcher()
            .subscribe(None, Box::new(handler))
            .await
    }

    pub async fn off(&self, id: SubscriptionId) -> bool {
        self.engine.dispatcher().unsubscribe(id).await
    }

    /// Report connectivity. Returns `true` if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.connectivity.set_online(online);
        if changed {
            info!(
                "Connectivity reported {}",
                if online { "online" } else { "offline" }
            );
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Spawn the scheduler. Returns `false` if it is already running.
    pub async fn start(&self) -> bool {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let (trigger, triggers) = SyncTrigger::channel();
        *self.trigger.lock().unwrap_or_else(|e| e.into_inner()) = trigger;
        *scheduler = Some(
            Scheduler::new(
                self.engine.clone(),
                self.connectivity.subscribe(),
                triggers,
                self.scheduler_config,
            )
            .spawn(),
        );
        if self.is_online() {
            self.request_cycle();
        }
        true
    }

    /// Stop the scheduler, letting a running cycle finish.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.shutdown().await;
        }
    }

    fn request_cycle(&self) {
        if !self.is_online() || self.engine.is_cycle_in_progress() {
            return;
        }
        self.trigger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .request();
    }
}
