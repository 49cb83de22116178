use std::sync::Arc;
use std::time::Duration;

use offline_action_sync::SyncConfig;
use offline_action_sync::queue::sync::{ExecutorRegistry, FnHandler, SyncEvent};
use offline_action_sync::queue::{OfflineQueue, SyncError, open_store};
use offline_action_sync::remote::HttpActionExecutor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("{}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), SyncError> {
	let config = match std::env::args().nth(1) {
		Some(path) => {
			info!("Loading config from {}", path);
			SyncConfig::from_file(path)?
		}
		None => {
			info!("No config file given, using defaults");
			SyncConfig::default()
		}
	};

	let base_url = config.remote.base_url.as_deref().ok_or_else(|| {
		SyncError::Config("remote.base_url must be set to reach the backend".to_string())
	})?;
	let executor = HttpActionExecutor::new(
		base_url,
		Duration::from_secs(config.remote.request_timeout_secs),
	)?;
	info!("Replaying actions against {}", executor.base_url());

	let store = open_store(&config.store).await?;
	let queue = OfflineQueue::builder(store, ExecutorRegistry::uniform(Arc::new(executor)))
		.config(config)
		.online(true)
		.build()?;

	queue
		.on_all(FnHandler::new("log", |event: &SyncEvent| match event {
			SyncEvent::Failed { action, reason } => {
				warn!("Action {} ({}) needs attention: {}", action.id, action.kind, reason)
			}
			SyncEvent::Conflict { action, .. } => {
				warn!("Action {} ({}) is in conflict", action.id, action.kind)
			}
			SyncEvent::CycleCompleted { report } if report.attempted > 0 => {
				info!("Cycle done: {}", report.summary())
			}
			_ => {}
		}))
		.await;

	let status = queue.status().await?;
	info!(
		"Queue loaded: {} pending, {} failed, {} in conflict",
		status.counts.pending, status.counts.failed, status.counts.conflict
	);

	queue.start().await;
	info!("Sync service running, press Ctrl-C to stop");

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for Ctrl-C: {}", e);
	}

	info!("Shutting down");
	queue.shutdown().await;
	Ok(())
}
