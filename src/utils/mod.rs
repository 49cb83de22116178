//!
//! Utility module for the offline queue.
//!
//! Re-exports the injectable clock used by the engine and scheduler.
/// Time source abstraction
pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
