use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::warn;

use super::{ActionFilter, ActionStore, plan_evictions, recover_interrupted};
use crate::queue::types::{ActionId, QueuedAction, SyncError};

/// Volatile implementation of ActionStore
pub struct InMemoryActionStore {
	records: RwLock<HashMap<ActionId, QueuedAction>>,
	max_records: usize,
}

impl InMemoryActionStore {
	pub fn new(max_records: usize) -> Self {
		Self {
			records: RwLock::new(HashMap::new()),
			max_records,
		}
	}

	/// Load previously persisted records, as a host would after a restart.
	pub fn with_records(records: Vec<QueuedAction>, max_records: usize) -> Self {
		let mut records = records;
		recover_interrupted(records.iter_mut());
		Self {
			records: RwLock::new(
				records
					.into_iter()
					.map(|record| (record.id, record))
					.collect(),
			),
			max_records,
		}
	}

	/// Every record currently held, in no particular order.
	pub async fn snapshot(&self) -> Vec<QueuedAction> {
		self.records.read().await.values().cloned().collect()
	}
}

#[async_trait::async_trait]
impl ActionStore for InMemoryActionStore {
	async fn put(&self, action: &QueuedAction) -> Result<Vec<QueuedAction>, SyncError> {
		let mut records = self.records.write().await;

		let victims = plan_evictions(records.values(), action, self.max_records)?;
		let mut evicted = Vec::with_capacity(victims.len());
		for id in victims {
			if let Some(record) = records.remove(&id) {
				warn!("Evicted action {} ({}) to stay under {} records", id, record.kind, self.max_records);
				evicted.push(record);
			}
		}

		records.insert(action.id, action.clone());
		Ok(evicted)
	}

	async fn get(&self, id: &ActionId) -> Result<Option<QueuedAction>, SyncError> {
		Ok(self.records.read().await.get(id).cloned())
	}

	async fn delete(&self, id: &ActionId) -> Result<bool, SyncError> {
		Ok(self.records.write().await.remove(id).is_some())
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
