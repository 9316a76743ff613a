//! Worker binary consuming tasks from the queue backend.
//!
//! Two operating modes, selected by the environment:
//!
//! - `TASK_DATA` set: execute that single task description and exit with a status
//!   reflecting the outcome. Suited to run-to-completion container instances.
//! - otherwise: poll the queue continuously until SIGINT/SIGTERM.

use anyhow::Context;
use std::sync::Arc;
use taskpipe::config::{self, QueueBackend, get_config};
use taskpipe::logging;
use taskpipe::notify::NotificationDispatcher;
use taskpipe::queue::provider::{QueueProvider, QueueTransport};
use taskpipe::queue::{CloudQueue, MockQueue};
use taskpipe::worker::{Consumer, ConsumerSettings, registry_from_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_config();
    logging::init_tracing();

    let config = get_config();
    tracing::info!(
        queue_backend = ?config.queue_backend,
        queue = %config.queue_name(),
        single_task = config.task_data.is_some(),
        "Worker starting"
    );

    let registry = registry_from_config().context("Failed to configure task handlers")?;
    let (transport, statuses) = build_queue().context("Failed to initialize queue backend")?;
    let consumer = Consumer::new(
        transport,
        statuses,
        registry,
        NotificationDispatcher::new(),
        ConsumerSettings::from_config(),
    );

    match config.task_data.as_deref() {
        Some(raw) => {
            let outcome = match consumer.run_single(raw).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "Invalid task description");
                    std::process::exit(1);
                }
            };
            std::process::exit(if outcome.is_completed() { 0 } else { 1 });
        }
        None => {
            consumer.run(shutdown_signal()).await;
        }
    }
    Ok(())
}

/// Construct the configured queue backend as both transport and status provider.
fn build_queue()
-> Result<(Arc<dyn QueueTransport>, Arc<dyn QueueProvider>), taskpipe::queue::QueueError> {
    match get_config().queue_backend {
        QueueBackend::Mock => {
            // Useful only for local smoke runs; a separate serving process cannot
            // share this queue's memory.
            tracing::warn!("Mock queue backend selected; tasks submitted elsewhere are invisible");
            let queue = Arc::new(MockQueue::new());
            let transport: Arc<dyn QueueTransport> = queue.clone();
            Ok((transport, queue))
        }
        QueueBackend::Cloud => {
            let queue = Arc::new(CloudQueue::from_config()?);
            let transport: Arc<dyn QueueTransport> = queue.clone();
            Ok((transport, queue))
        }
    }
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received terminate signal"),
    }
}
