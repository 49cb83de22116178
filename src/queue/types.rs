use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Unique identifier for a queued action, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(Uuid);

impl ActionId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for ActionId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ActionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ActionId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// Every kind of deferred intent the queue knows how to replay.
///
/// Adding a variant forces a matching executor registration, see
/// [`ExecutorRegistryBuilder::build`](crate::queue::sync::executor::ExecutorRegistryBuilder::build).
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	EnumIter,
	Display,
	EnumString,
	AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKind {
	Vote,
	Tip,
	Comment,
	Reaction,
	Follow,
	Unfollow,
	JoinCommunity,
	LeaveCommunity,
	CreatePost,
	SendMessage,
	DeleteMessage,
	MarkNotificationRead,
}

/// Priority tier. Declaration order gives `Low < Normal < High`.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	Low,
	#[default]
	Normal,
	High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
	Pending,
	Syncing,
	Synced,
	Failed,
	Conflict,
}

impl ActionStatus {
	/// Live records still carry user intent that has not been settled.
	pub fn is_live(&self) -> bool {
		matches!(
			self,
			ActionStatus::Pending | ActionStatus::Syncing | ActionStatus::Conflict
		)
	}

	/// Records an operator has to look at: dead letters and unresolved conflicts.
	pub fn needs_attention(&self) -> bool {
		matches!(self, ActionStatus::Failed | ActionStatus::Conflict)
	}
}

/// Caller-supplied options for [`OfflineQueue::enqueue`](crate::queue::OfflineQueue::enqueue).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
	pub priority: Priority,
	/// Falls back to the configured default when unset.
	pub max_attempts: Option<u32>,
	pub owner_id: String,
	pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
	pub fn for_owner(owner_id: impl Into<String>) -> Self {
		Self {
			owner_id: owner_id.into(),
			..Default::default()
		}
	}

	pub fn with_priority(mut self, priority: Priority) -> Self {
		self.priority = priority;
		self
	}

	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = Some(max_attempts);
		self
	}

	pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
		self.idempotency_key = Some(key.into());
		self
	}
}

/// The unit of deferred work, persisted as-is by every [`ActionStore`](crate::queue::store::ActionStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
	pub id: ActionId,
	pub kind: ActionKind,
	pub payload: Value,
	pub priority: Priority,
	pub created_at: DateTime<Utc>,
	pub owner_id: String,
	pub status: ActionStatus,
	pub attempt_count: u32,
	pub max_attempts: u32,
	#[serde(default)]
	pub last_attempt_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub next_retry_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub conflict_data: Option<Value>,
	#[serde(default)]
	pub idempotency_key: Option<String>,
	/// Set by a client-wins resolution; executors must ask the server to skip its conflict check.
	#[serde(default)]
	pub force: bool,
	#[serde(default)]
	pub last_error: Option<String>,
}

impl QueuedAction {
	pub fn new(
		kind: ActionKind,
		payload: Value,
		options: EnqueueOptions,
		max_attempts: u32,
		created_at: DateTime<Utc>,
	) -> Self {
		Self {
			id: ActionId::new(),
			kind,
			payload,
			priority: options.priority,
			created_at,
			owner_id: options.owner_id,
			status: ActionStatus::Pending,
			attempt_count: 0,
			max_attempts,
			last_attempt_at: None,
			next_retry_at: None,
			conflict_data: None,
			idempotency_key: options.idempotency_key,
			force: false,
			last_error: None,
		}
	}

	/// Pending with no retry time, or a retry time that has elapsed.
	pub fn is_due(&self, now: DateTime<Utc>) -> bool {
		self.status == ActionStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
	}

	pub fn attempts_remaining(&self) -> u32 {
		self.max_attempts.saturating_sub(self.attempt_count)
	}

	pub fn mark_syncing(&mut self, now: DateTime<Utc>) {
		self.status = ActionStatus::Syncing;
		self.last_attempt_at = Some(now);
		self.next_retry_at = None;
	}

	pub fn mark_synced(&mut self) {
		self.status = ActionStatus::Synced;
		self.last_error = None;
	}

	/// Conflicts never consume an attempt and never schedule a retry.
	pub fn mark_conflict(&mut self, conflict_data: Value) {
		self.status = ActionStatus::Conflict;
		self.conflict_data = Some(conflict_data);
		self.next_retry_at = None;
	}

	/// Counts one execution attempt, bounded by `max_attempts`.
	pub fn register_attempt(&mut self) -> u32 {
		self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
		self.attempt_count
	}

	pub fn schedule_retry(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
		self.status = ActionStatus::Pending;
		self.next_retry_at = Some(at);
		self.last_error = Some(reason.into());
	}

	pub fn mark_failed(&mut self, reason: impl Into<String>) {
		self.status = ActionStatus::Failed;
		self.next_retry_at = None;
		self.last_error = Some(reason.into());
	}

	/// Puts the action back in line as a fresh attempt with a replacement payload.
	pub fn requeue(&mut self, payload: Value, force: bool) {
		self.status = ActionStatus::Pending;
		self.payload = payload;
		self.force = force;
		self.attempt_count = 0;
		self.next_retry_at = None;
		self.conflict_data = None;
		self.last_error = None;
	}

	/// Crash recovery: a record caught mid-execution goes back to `Pending`.
	pub fn recover_interrupted(&mut self) -> bool {
		if self.status == ActionStatus::Syncing {
			self.status = ActionStatus::Pending;
			true
		} else {
			false
		}
	}

	pub fn is_same_intent(&self, owner_id: &str, idempotency_key: &str) -> bool {
		self.status.is_live()
			&& self.owner_id == owner_id
			&& self.idempotency_key.as_deref() == Some(idempotency_key)
	}
}

/// Drain order: priority high to low, then oldest first, then id for a stable tie-break.
pub fn queue_order(a: &QueuedAction, b: &QueuedAction) -> Ordering {
	b.priority
		.cmp(&a.priority)
		.then_with(|| a.created_at.cmp(&b.created_at))
		.then_with(|| a.id.cmp(&b.id))
}

/// Per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
	pub pending: usize,
	pub syncing: usize,
	pub synced: usize,
	pub failed: usize,
	pub conflict: usize,
}

impl StatusCounts {
	pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a QueuedAction>) -> Self {
		let mut counts = Self::default();
		for action in actions {
			counts.record(action.status);
		}
		counts
	}

	pub fn record(&mut self, status: ActionStatus) {
		match status {
			ActionStatus::Pending => self.pending += 1,
			ActionStatus::Syncing => self.syncing += 1,
			ActionStatus::Synced => self.synced += 1,
			ActionStatus::Failed => self.failed += 1,
			ActionStatus::Conflict => self.conflict += 1,
		}
	}

	pub fn total(&self) -> usize {
		self.pending + self.syncing + self.synced + self.failed + self.conflict
	}
}

/// Snapshot returned by [`OfflineQueue::status`](crate::queue::OfflineQueue::status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
	pub counts: StatusCounts,
	pub online: bool,
	pub cycle_in_progress: bool,
	pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Errors surfaced by the queue. Per-action remote failures are not errors, they are
/// [`Outcome`](crate::queue::sync::executor::Outcome)s absorbed into record state.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Store error: {0}")]
	Store(String),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("No executor registered for action kinds: {0:?}")]
	MissingExecutors(Vec<ActionKind>),

	#[error("Store is full ({max_records} records) and nothing can be evicted")]
	StoreFull { max_records: usize },

	#[error("Cannot sync while offline")]
	Offline,

	#[error("Invalid input: {0}")]
	InvalidInput(String),

	#[error("HTTP error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("Configuration error: {0}")]
	Config(String),
}

pub type SyncResult<T> = Result<T, SyncError>;
