//! Runtime configuration for the offline queue.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a valid
//! configuration. Durations are expressed in whole seconds or milliseconds to keep the file
//! format plain JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::types::SyncError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
	/// Periodic cycle timer while online
	pub sync_interval_secs: u64,
	/// Timer that only looks for actions whose retry time has elapsed
	pub retry_check_interval_secs: u64,
	/// Worker pool size for one cycle; 1 drains strictly sequentially
	pub max_concurrency: usize,
	/// Used when an enqueue call does not set its own ceiling
	pub default_max_attempts: u32,
	pub retry: RetryConfig,
	pub store: StoreConfig,
	pub remote: RemoteConfig,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			sync_interval_secs: 30,
			retry_check_interval_secs: 5,
			max_concurrency: 1,
			default_max_attempts: 5,
			retry: RetryConfig::default(),
			store: StoreConfig::default(),
			remote: RemoteConfig::default(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
	pub base_delay_ms: u64,
	pub growth_factor: f64,
	pub max_delay_ms: u64,
	pub jitter_ratio: f64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			base_delay_ms: 1_000,
			growth_factor: 2.0,
			max_delay_ms: 300_000,
			jitter_ratio: 0.1,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
	pub max_records: usize,
	/// Directory for the file store; in-memory when unset
	pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			max_records: 1_000,
			data_dir: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
	pub base_url: Option<String>,
	pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
	fn default() -> Self {
		Self {
			base_url: None,
			request_timeout_secs: 30,
		}
	}
}

impl SyncConfig {
	/// Parse a JSON config file and validate it.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path).map_err(|e| {
			SyncError::Config(format!("Failed to read config file {:?}: {}", path, e))
		})?;
		Self::from_json(&content)
	}

	pub fn from_json(content: &str) -> Result<Self, SyncError> {
		let config: Self = serde_json::from_str(content)
			.map_err(|e| SyncError::Config(format!("Invalid config JSON: {}", e)))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		if self.sync_interval_secs == 0 || self.retry_check_interval_secs == 0 {
			return Err(SyncError::Config(
				"sync intervals must be at least one second".to_string(),
			));
		}
		if self.max_concurrency == 0 {
			return Err(SyncError::Config("max_concurrency must be at least 1".to_string()));
		}
		if self.default_max_attempts == 0 {
			return Err(SyncError::Config(
				"default_max_attempts must be at least 1".to_string(),
			));
		}
		if !self.retry.growth_factor.is_finite() || self.retry.growth_factor < 1.0 {
			return Err(SyncError::Config("retry.growth_factor must be >= 1".to_string()));
		}
		if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
			return Err(SyncError::Config(
				"retry.jitter_ratio must be between 0 and 1".to_string(),
			));
		}
		if self.store.max_records == 0 {
			return Err(SyncError::Config("store.max_records must be at least 1".to_string()));
		}
		Ok(())
	}

	pub fn sync_interval(&self) -> Duration {
		Duration::from_secs(self.sync_interval_secs)
	}

	pub fn retry_check_interval(&self) -> Duration {
		Duration::from_secs(self.retry_check_interval_secs)
	}
}
