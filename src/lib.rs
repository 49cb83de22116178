//! Offline-first action queue with a sync engine.
//!
//! Record user intents while the backend is unreachable, persist them, and reconcile them with the
//! server once connectivity returns: priority-ordered draining, bounded retries with backoff,
//! conflict detection with pluggable resolution, and events for every state change.

pub mod config;
pub mod queue;
pub mod remote;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use config::SyncConfig;
pub use queue::OfflineQueue;
