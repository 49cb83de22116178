//! Executor registry: maps each action kind to the remote call that applies it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use strum::IntoEnumIterator;
use tracing::{debug, error};

use crate::queue::types::{ActionKind, QueuedAction, SyncError};

/// Result of one execution attempt, as classified by the executor itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    /// The server state disagrees with the action; carries the server's view.
    Conflict(Value),
    /// Worth retrying later (network error, 5xx).
    TransientFailure(String),
    /// Will fail the same way on replay (4xx other than 409).
    PermanentFailure(String),
}

impl Outcome {
    /// Classify an HTTP response: 2xx succeeds, 409 conflicts, 5xx is transient and any other
    /// 4xx is permanent. A 409 body that is valid JSON becomes the conflict data as-is.
    pub fn from_http_status(status: u16, body: &str) -> Self {
        match status {
            200..=299 => Outcome::Success,
            409 => Outcome::Conflict(
                serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string())),
            ),
            400..=499 => Outcome::PermanentFailure(describe_status(status, body)),
            500..=599 => Outcome::TransientFailure(describe_status(status, body)),
            _ => Outcome::TransientFailure(format!("Unexpected HTTP status {}", status)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Conflict(_) => "conflict",
            Outcome::TransientFailure(_) => "transient_failure",
            Outcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

fn describe_status(status: u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("{} ({})", trimmed, status)
    }
}

/// Thin adapter to the backend call for one or more action kinds.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Attempt to apply the action remotely. Must not panic; every failure is an [`Outcome`].
    async fn execute(&self, action: &QueuedAction) -> Outcome;

    /// Get the name of this executor for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Exhaustive `ActionKind -> ActionExecutor` table.
///
/// Only obtainable through [`ExecutorRegistryBuilder::build`] or [`ExecutorRegistry::uniform`],
/// both of which guarantee every kind has an executor.
#[derive(Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn builder() -> ExecutorRegistryBuilder {
        ExecutorRegistryBuilder::default()
    }

    /// Route every kind to the same executor.
    pub fn uniform(executor: Arc<dyn ActionExecutor>) -> Self {
        Self {
            executors: ActionKind::iter()
                .map(|kind| (kind, executor.clone()))
                .collect(),
        }
    }

    pub async fn execute(&self, action: &QueuedAction) -> Outcome {
        match self.executors.get(&action.kind) {
            Some(executor) => {
                debug!(
                    "Executing action {} ({}) via {}",
                    action.id,
                    action.kind,
                    executor.name()
                );
                executor.execute(action).await
            }
            None => {
                // Unreachable through the public constructors.
                error!("No executor registered for {}", action.kind);
                Outcome::PermanentFailure(format!("No executor registered for {}", action.kind))
            }
        }
    }
}

#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<ActionKind, Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistryBuilder {
    pub fn register(self, kind: ActionKind, executor: impl ActionExecutor + 'static) -> Self {
        self.register_shared(kind, Arc::new(executor))
    }

    pub fn register_shared(mut self, kind: ActionKind, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn register_many(
        mut self,
        kinds: impl IntoIterator<Item = ActionKind>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        for kind in kinds {
            self.executors.insert(kind, executor.clone());
        }
        self
    }

    /// Fails with [`SyncError::MissingExecutors`] listing every kind left without an executor.
    pub fn build(self) -> Result<ExecutorRegistry, SyncError> {
        let missing: Vec<ActionKind> = ActionKind::iter()
            .filter(|kind| !self.executors.contains_key(kind))
            .collect();
        if !missing.is_empty() {
            return Err(SyncError::MissingExecutors(missing));
        }
        Ok(ExecutorRegistry {
            executors: self.executors,
        })
    }
}
