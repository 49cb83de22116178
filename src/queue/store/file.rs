use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{ActionFilter, ActionStore, plan_evictions, recover_interrupted};
use crate::queue::types::{ActionId, ActionStatus, QueuedAction, SyncError};

const RECORD_PREFIX: &str = "action_";
const RECORD_SUFFIX: &str = ".json";
const TMP_SUFFIX: &str = ".json.tmp";

/// File-based implementation of ActionStore
///
/// Each record lives in its own `action_<id>.json` file inside `data_dir`. Writes go to a
/// temporary file that is flushed to disk and then renamed into place, so a crash or power loss
/// leaves either the old or the new version of a record. Temporary files orphaned by a crash are
/// removed on open. All records are also cached in memory; the directory is only
/// scanned once, in [`FileActionStore::open`].
pub struct FileActionStore {
	data_dir: PathBuf,
	max_records: usize,
	records: RwLock<HashMap<ActionId, QueuedAction>>,
}

impl FileActionStore {
	/// Open (creating if needed) a store directory and load every record in it.
	///
	/// Records found in `Syncing` are reset to `Pending` and written back before this returns.
	pub async fn open(data_dir: impl Into<PathBuf>, max_records: usize) -> Result<Self, SyncError> {
		let data_dir = data_dir.into();
		tokio::fs::create_dir_all(&data_dir).await?;

		let mut loaded = Vec::new();
		let mut entries = tokio::fs::read_dir(&data_dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if is_orphaned_tmp(&path) {
				warn!("Removing unfinished action record write {:?}", path);
				tokio::fs::remove_file(&path).await?;
				continue;
			}
			if record_id_from_path(&path).is_none() {
				continue;
			}

			let content = tokio::fs::read_to_string(&path).await?;
			match serde_json::from_str::<QueuedAction>(&content) {
				Ok(record) => loaded.push(record),
				Err(e) => {
					// Left on disk untouched so an operator can inspect it.
					warn!("Skipping unreadable action record {:?}: {}", path, e);
				}
			}
		}

		let interrupted: Vec<ActionId> = loaded
			.iter()
			.filter(|record| record.status == ActionStatus::Syncing)
			.map(|record| record.id)
			.collect();
		let recovered = recover_interrupted(loaded.iter_mut());

		let store = Self {
			data_dir,
			max_records,
			records: RwLock::new(HashMap::new()),
		};

		{
			let mut records = store.records.write().await;
			for record in loaded {
				if interrupted.contains(&record.id) {
					store.write_record(&record).await?;
				}
				records.insert(record.id, record);
			}
		}

		info!(
			"Loaded {} queued actions from {:?} ({} recovered)",
			store.records.read().await.len(),
			store.data_dir,
			recovered
		);
		Ok(store)
	}

	pub fn data_dir(&self) -> &Path {
		&self.data_dir
	}

	fn record_path(&self, id: &ActionId) -> PathBuf {
		self.data_dir
			.join(format!("{}{}{}", RECORD_PREFIX, id, RECORD_SUFFIX))
	}

	async fn write_record(&self, record: &QueuedAction) -> Result<(), SyncError> {
		let path = self.record_path(&record.id);
		let tmp_path = path.with_extension("json.tmp");

		let content = serde_json::to_vec_pretty(record)?;
		let mut file = tokio::fs::File::create(&tmp_path).await?;
		file.write_all(&content).await?;
		file.sync_all().await?;
		drop(file);

		tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
			SyncError::Store(format!("Failed to move action record into place {:?}: {}", path, e))
		})?;
		self.sync_dir().await;

		debug!("Wrote action record {:?} ({})", path, record.status);
		Ok(())
	}

	async fn remove_record(&self, id: &ActionId) -> Result<(), SyncError> {
		let path = self.record_path(id);
		match tokio::fs::remove_file(&path).await {
			Ok(()) => {
				self.sync_dir().await;
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Flush directory entries so renames and removals survive power loss.
	#[cfg(unix)]
	async fn sync_dir(&self) {
		let synced = match tokio::fs::File::open(&self.data_dir).await {
			Ok(dir) => dir.sync_all().await,
			Err(e) => Err(e),
		};
		if let Err(e) = synced {
			debug!("Failed to sync store directory {:?}: {}", self.data_dir, e);
		}
	}

	#[cfg(not(unix))]
	async fn sync_dir(&self) {}
}

fn is_orphaned_tmp(path: &Path) -> bool {
	path.file_name()
		.and_then(|f| f.to_str())
		.is_some_and(|f| f.starts_with(RECORD_PREFIX) && f.ends_with(TMP_SUFFIX))
}

fn record_id_from_path(path: &Path) -> Option<ActionId> {
	path.file_name()
		.and_then(|f| f.to_str())
		.and_then(|f| f.strip_prefix(RECORD_PREFIX))
		.and_then(|s| s.strip_suffix(RECORD_SUFFIX))
		.and_then(|s| s.parse::<ActionId>().ok())
}

#[async_trait::async_trait]
impl ActionStore for FileActionStore {
	async fn put(&self, action: &QueuedAction) -> Result<Vec<QueuedAction>, SyncError> {
		let mut records = self.records.write().await;

		let victims = plan_evictions(records.values(), action, self.max_records)?;

		self.write_record(action).await?;
		records.insert(action.id, action.clone());

		let mut evicted = Vec::with_capacity(victims.len());
		for id in victims {
			self.remove_record(&id).await?;
			if let Some(record) = records.remove(&id) {
				warn!(
					"Evicted action {} ({}) to stay under {} records",
					id, record.kind, self.max_records
				);
				evicted.push(record);
			}
		}

		Ok(evicted)
	}

	async fn get(&self, id: &ActionId) -> Result<Option<QueuedAction>, SyncError> {
		Ok(self.records.read().await.get(id).cloned())
	}

	async fn delete(&self, id: &ActionId) -> Result<bool, SyncError> {
		let mut records = self.records.write().await;
		if records.remove(id).is_none() {
			return Ok(false);
		}
		self.remove_record(id).await?;
		Ok(true)
	}

	async fn list(&self, filter: &ActionFilter) -> Result<Vec<QueuedAction>, SyncError> {
		Ok(self
			.records
			.read()
			.await
			.values()
			.filter(|action| filter.matches(action))
			.cloned()
			.collect())
	}
}
