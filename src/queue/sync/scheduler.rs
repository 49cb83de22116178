//! Scheduler: decides when the engine runs.
//!
//! One background task reacts to four triggers and runs at most one cycle at a time:
//! - an offline to online transition of the [`Connectivity`] signal;
//! - the periodic timer, while online;
//! - the retry timer, while online and only if some retry time has elapsed;
//! - an explicit request through [`SyncTrigger`], while online.
//!
//! Requests that arrive while a cycle is running are dropped rather than queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::queue::sync::engine::SyncEngine;

/// Online/offline signal fed by the host.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(online)),
        }
    }

    /// Returns `true` if this call changed the state.
    pub fn set_online(&self, online: bool) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        })
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Fire-and-forget cycle request.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
    tx: mpsc::Sender<()>,
}

impl SyncTrigger {
    /// Create a trigger and the receiving end handed to [`Scheduler::spawn`].
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns `false` when a request is already waiting or the scheduler is gone.
    pub fn request(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub sync_interval: Duration,
    pub retry_check_interval: Duration,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    connectivity: watch::Receiver<bool>,
    triggers: mpsc::Receiver<()>,
    config: SchedulerConfig,
}

/// Handle to the running scheduler task.
pub struct SchedulerHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the scheduler and wait for it. A cycle that is already running finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.join.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Scheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        connectivity: watch::Receiver<bool>,
        triggers: mpsc::Receiver<()>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            engine,
            connectivity,
            triggers,
            config,
        }
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(self.run(shutdown_rx));
        SchedulerHandle { shutdown, join }
    }

    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        // Startup is covered by reconnects and explicit requests, so the timers wait a full period.
        let start = Instant::now();
        let mut periodic =
            tokio::time::interval_at(start + self.config.sync_interval, self.config.sync_interval);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut retry_check = tokio::time::interval_at(
            start + self.config.retry_check_interval,
            self.config.retry_check_interval,
        );
        retry_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut watching_connectivity = true;

        info!(
            "Scheduler started (sync every {:?}, retry check every {:?})",
            self.config.sync_interval, self.config.retry_check_interval
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    break;
                }
                changed = self.connectivity.changed(), if watching_connectivity => {
                    if changed.is_err() {
                        debug!("Connectivity signal dropped, keeping last known state");
                        watching_connectivity = false;
                        continue;
                    }
                    if *self.connectivity.borrow_and_update() {
                        info!("Connectivity restored");
                        self.run_cycle("reconnect").await;
                    } else {
                        info!("Connectivity lost, pausing sync");
                    }
                }
                Some(()) = self.triggers.recv() => {
                    if self.is_online() {
                        self.run_cycle("requested").await;
                    }
                }
                _ = periodic.tick() => {
                    if self.is_online() && !self.engine.is_cycle_in_progress() {
                        self.run_cycle("periodic").await;
                    }
                }
                _ = retry_check.tick() => {
                    if self.is_online() && !self.engine.is_cycle_in_progress() {
                        match self.engine.has_due_retries().await {
                            Ok(true) => self.run_cycle("retry due").await,
                            Ok(false) => {}
                            Err(e) => error!("Failed to check for due retries: {}", e),
                        }
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    async fn run_cycle(&mut self, reason: &str) {
        debug!("Running sync cycle ({})", reason);
        match self.engine.run_cycle().await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("Skipped {} cycle, another is in progress", reason),
            Err(e) => error!("Sync cycle ({}) failed: {}", reason, e),
        }
        // Requests made while the cycle ran are not replayed.
        while self.triggers.try_recv().is_ok() {}
    }
}
