//! Remote backend integration
//!
//! This module provides the HTTP executor that replays queued actions against the backend REST API
//! and classifies each response into an [`Outcome`](crate::queue::sync::Outcome).

/// reqwest-based action executor
mod client;

pub use client::HttpActionExecutor;
