//!
//! HTTP executor for queued actions.
//!
//! Every action is sent as `POST {base_url}/actions/{kind}` with a JSON body carrying the payload
//! and owner. The action id doubles as the `Idempotency-Key` header so the backend can drop
//! replays, and a client-wins resolution adds `X-Force-Override: true`.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::queue::sync::{ActionExecutor, Outcome};
use crate::queue::types::{QueuedAction, SyncError};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
pub const FORCE_HEADER: &str = "X-Force-Override";

/// Backend REST executor
#[derive(Clone)]
pub struct HttpActionExecutor {
	/// The underlying HTTP client.
	http_client: Client,
	/// Base URL without a trailing slash.
	base_url: String,
}

impl HttpActionExecutor {
	/// Create a new executor.
	///
	/// # Arguments
	/// * `base_url` - The backend API root, e.g. `https://api.example.com/v1`.
	/// * `timeout` - Per-request timeout.
	///
	/// # Errors
	/// Returns `SyncError::Config` for an unusable URL and `SyncError::Http` if the client cannot be built.
	pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
		let base_url = normalize_base_url(base_url)?;
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			base_url,
		})
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	fn action_url(&self, action: &QueuedAction) -> String {
		format!("{}/actions/{}", self.base_url, action.kind)
	}
}

fn normalize_base_url(base_url: &str) -> Result<String, SyncError> {
	let trimmed = base_url.trim().trim_end_matches('/');
	let url = reqwest::Url::parse(trimmed)
		.map_err(|e| SyncError::Config(format!("Invalid remote base URL {:?}: {}", base_url, e)))?;
	if !matches!(url.scheme(), "http" | "https") {
		return Err(SyncError::Config(format!(
			"Remote base URL must be http or https, got {}",
			url.scheme()
		)));
	}
	Ok(trimmed.to_string())
}

/// JSON body sent for one action.
fn request_body(action: &QueuedAction) -> Value {
	json!({
		"id": action.id,
		"kind": action.kind,
		"payload": action.payload,
		"owner_id": action.owner_id,
		"created_at": action.created_at,
		"force": action.force,
	})
}

#[async_trait::async_trait]
impl ActionExecutor for HttpActionExecutor {
	async fn execute(&self, action: &QueuedAction) -> Outcome {
		let url = self.action_url(action);
		debug!("POST {} for action {}", url, action.id);

		let mut request = self
			.http_client
			.post(&url)
			.header(IDEMPOTENCY_HEADER, action.id.to_string())
			.json(&request_body(action));
		if action.force {
			request = request.header(FORCE_HEADER, "true");
		}

		let response = match request.send().await {
			Ok(response) => response,
			Err(e) => {
				warn!("Request for action {} failed: {}", action.id, e);
				return Outcome::TransientFailure(format!("Network error: {}", e));
			}
		};

		let status = response.status().as_u16();
		let body = match response.text().await {
			Ok(body) => body,
			Err(e) => {
				// Status is known; only the details are lost.
				warn!("Failed to read response body for action {}: {}", action.id, e);
				String::new()
			}
		};

		Outcome::from_http_status(status, &body)
	}

	fn name(&self) -> &'static str {
		"HttpActionExecutor"
	}
}
