//! Conflict resolution decision table.
//!
//! The resolver never touches the store or the network. Given an action in conflict, the
//! server-side state returned by its executor and a strategy, it decides whether the local intent
//! is abandoned or replayed, and with which payload. Per-kind [`MergeRule`]s let the engine settle
//! some conflicts automatically the moment they are detected.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::queue::types::{ActionKind, QueuedAction};

/// How the caller wants a conflict settled.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionStrategy {
    /// The server state is authoritative; the local intent is dropped.
    ServerWins,
    /// Replay the original payload and ask the server to skip its conflict check.
    ClientWins,
    /// Replay with a payload merged from both sides.
    Merge(Value),
    /// Replay with a payload the user picked by hand.
    Manual(Value),
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::ServerWins => "server_wins",
            ResolutionStrategy::ClientWins => "client_wins",
            ResolutionStrategy::Merge(_) => "merge",
            ResolutionStrategy::Manual(_) => "manual",
        }
    }
}

/// What happens to the action.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Discard,
    RetryWithPayload { payload: Value, force: bool },
}

/// Automatic merge for one action kind.
///
/// Returning `None` leaves the action in `Conflict` for a caller to resolve.
pub trait MergeRule: Send + Sync {
    fn merge(&self, local: &Value, server: &Value) -> Option<Value>;
}

impl<F> MergeRule for F
where
    F: Fn(&Value, &Value) -> Option<Value> + Send + Sync,
{
    fn merge(&self, local: &Value, server: &Value) -> Option<Value> {
        self(local, server)
    }
}

#[derive(Clone, Default)]
pub struct ConflictResolver {
    rules: HashMap<ActionKind, Arc<dyn MergeRule>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an automatic merge for `kind`, replacing any previous one.
    pub fn with_rule(mut self, kind: ActionKind, rule: impl MergeRule + 'static) -> Self {
        self.rules.insert(kind, Arc::new(rule));
        self
    }

    pub fn has_rule(&self, kind: ActionKind) -> bool {
        self.rules.contains_key(&kind)
    }

    pub fn resolve(
        &self,
        action: &QueuedAction,
        _conflict_data: &Value,
        strategy: ResolutionStrategy,
    ) -> Resolution {
        match strategy {
            ResolutionStrategy::ServerWins => Resolution::Discard,
            ResolutionStrategy::ClientWins => Resolution::RetryWithPayload {
                payload: action.payload.clone(),
                force: true,
            },
            ResolutionStrategy::Merge(payload) | ResolutionStrategy::Manual(payload) => {
                Resolution::RetryWithPayload {
                    payload,
                    force: false,
                }
            }
        }
    }

    /// Ask the registered rule for `action.kind`, if any, for a merged payload.
    pub fn auto_resolve(&self, action: &QueuedAction, conflict_data: &Value) -> Option<Resolution> {
        let rule = self.rules.get(&action.kind)?;
        let merged = rule.merge(&action.payload, conflict_data)?;
        Some(self.resolve(action, conflict_data, ResolutionStrategy::Merge(merged)))
    }
}
