//! Offline action queue.
//!
//! Callers record intended state changes while disconnected; the queue persists them and later
//! replays them against the backend, isolating failures per action and surfacing conflicts for a
//! decision instead of retrying them blindly.

/// Public entry point
pub mod facade;
/// Persistence of queued actions
pub mod store;
/// Engine, executors, retry, conflicts, events and scheduling
pub mod sync;
/// Action record model and errors
pub mod types;

pub use facade::{OfflineQueue, OfflineQueueBuilder};
pub use store::{ActionFilter, ActionStore, FileActionStore, InMemoryActionStore, open_store};
pub use types::{
    ActionId, ActionKind, ActionStatus, EnqueueOptions, Priority, QueueStatus, QueuedAction,
    StatusCounts, SyncError, SyncResult,
};
