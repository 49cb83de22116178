//! Action Synchronization Module
//!
//! This module holds everything that moves queued actions to the backend:
//!
//! - `engine`: runs one sync cycle at a time, drains due actions in priority order and routes each outcome into persisted state.
//! - `executor`: the `ActionExecutor` trait, the `Outcome` taxonomy and the exhaustive per-kind registry.
//! - `retry`: exponential backoff with jitter and the attempt bound.
//! - `conflict`: resolution strategies and optional per-kind merge rules.
//! - `events`: event types, handler trait and the dispatcher behind `on`/`off`.
//! - `report`: the per-cycle summary.
//! - `scheduler`: connectivity, timers and manual triggers that decide when a cycle runs.

/// Conflict resolution strategies and merge rules
pub mod conflict;
/// Cycle execution and outcome routing
pub mod engine;
/// Event system for decoupled communication during sync
pub mod events;
/// Remote executors and their registry
pub mod executor;
/// Per-cycle reporting
pub mod report;
/// Backoff policy
pub mod retry;
/// Trigger loop
pub mod scheduler;

pub use conflict::{ConflictResolver, MergeRule, Resolution, ResolutionStrategy};
pub use engine::{Inserted, SyncEngine};
pub use events::{EventDispatcher, EventKind, FnHandler, SubscriptionId, SyncEvent, SyncEventHandler};
pub use executor::{ActionExecutor, ExecutorRegistry, ExecutorRegistryBuilder, Outcome};
pub use report::{ActionResult, SyncCycleReport};
pub use retry::RetryPolicy;
pub use scheduler::{Connectivity, Scheduler, SchedulerConfig, SchedulerHandle, SyncTrigger};
