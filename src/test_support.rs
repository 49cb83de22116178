//! Test doubles shared by the engine, scheduler, facade and scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::queue::store::InMemoryActionStore;
use crate::queue::sync::{
    ActionExecutor, EventDispatcher, ExecutorRegistry, Outcome, SyncEngine,
};
use crate::queue::types::{ActionId, ActionKind, QueuedAction};
use crate::utils::ManualClock;

#[derive(Default)]
struct Script {
    outcomes: HashMap<ActionKind, VecDeque<Outcome>>,
    calls: Vec<ActionId>,
    forced: Vec<ActionId>,
}

/// Executor that replays queued outcomes per kind, succeeding once a kind's queue is empty.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `execute` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, kind: ActionKind, outcome: Outcome) {
        self.push_many(kind, [outcome]);
    }

    pub fn push_many(&self, kind: ActionKind, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script
            .lock()
            .unwrap()
            .outcomes
            .entry(kind)
            .or_default()
            .extend(outcomes);
    }

    /// Ids passed to `execute`, in call order.
    pub fn calls(&self) -> Vec<ActionId> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Ids executed with the force flag set.
    pub fn forced_calls(&self) -> Vec<ActionId> {
        self.script.lock().unwrap().forced.clone()
    }
}

#[async_trait::async_trait]
impl ActionExecutor for ScriptedExecutor {
    async fn execute(&self, action: &QueuedAction) -> Outcome {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(action.id);
            if action.force {
                script.forced.push(action.id);
            }
            script
                .outcomes
                .get_mut(&action.kind)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Outcome::Success)
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    fn name(&self) -> &'static str {
        "ScriptedExecutor"
    }
}

/// Sequential engine over an in-memory store and a manual clock.
pub fn test_engine(
    executor: ScriptedExecutor,
) -> (SyncEngine, Arc<InMemoryActionStore>, Arc<ManualClock>) {
    let store = Arc::new(InMemoryActionStore::new(100));
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = SyncEngine::new(
        store.clone(),
        ExecutorRegistry::uniform(Arc::new(executor)),
        clock.clone(),
        Arc::new(EventDispatcher::new()),
    );
    (engine, store, clock)
}
