//! Queue provider abstraction.
//!
//! The serving tier submits tasks and polls status through [`QueueProvider`]; the worker
//! consumes messages through [`QueueTransport`]. Two backends implement both contracts:
//! an in-memory mock for development and tests, and the HTTP-backed cloud queue.

pub mod cloud;
pub mod mock;
pub mod provider;
pub mod types;

pub use cloud::CloudQueue;
pub use mock::MockQueue;
pub use provider::{MAX_MESSAGE_BYTES, QueueProvider, QueueTransport};
pub use types::{
    MessageReceipt, QueueError, ReceivedMessage, TaskMessage, TaskStatus, TaskStatusRecord,
};

use crate::config::{QueueBackend, get_config};
use std::sync::Arc;

/// Build the provider selected by `QUEUE_PROVIDER` for the serving tier.
pub fn provider_from_config() -> Result<Arc<dyn QueueProvider>, QueueError> {
    let config = get_config();
    match config.queue_backend {
        QueueBackend::Mock => {
            tracing::info!("Using mock queue provider");
            Ok(Arc::new(MockQueue::new()))
        }
        QueueBackend::Cloud => {
            tracing::info!(queue = %config.queue_name(), "Using cloud queue provider");
            Ok(Arc::new(CloudQueue::from_config()?))
        }
    }
}
