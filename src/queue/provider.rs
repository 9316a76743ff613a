//! Provider and transport traits implemented by each queue backend.

use crate::queue::types::{
    MessageReceipt, QueueError, ReceivedMessage, TaskMessage, TaskStatusRecord,
    current_timestamp_rfc3339,
};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Message-size ceiling shared by the supported cloud queue transports.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Submission and status surface used by the serving tier.
///
/// Connectivity failures surface as [`QueueError::ProviderUnavailable`] and are never
/// swallowed; callers decide whether to retry or degrade (the HTTP surface maps them to
/// a 503 response).
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Enqueue a task and return its identifier.
    async fn submit(
        &self,
        task_type: &str,
        payload: Value,
        webhook_url: Option<String>,
    ) -> Result<String, QueueError>;

    /// Fetch the status record for a previously submitted task.
    async fn status(&self, task_id: &str) -> Result<TaskStatusRecord, QueueError>;

    /// Upsert a status record as processing advances. Called by the worker.
    async fn record_status(&self, record: TaskStatusRecord) -> Result<(), QueueError>;
}

/// Consumption surface used by the worker loop.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Receive up to `max_messages`, hiding each from other consumers for `visibility`.
    async fn receive(
        &self,
        max_messages: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge a message, removing it permanently from the queue.
    async fn delete(&self, receipt: &MessageReceipt) -> Result<(), QueueError>;

    /// Renew the lease on an in-flight message, returning the refreshed receipt.
    async fn extend_visibility(
        &self,
        receipt: &MessageReceipt,
        visibility: Duration,
    ) -> Result<MessageReceipt, QueueError>;
}

/// Assemble and serialize a task message, enforcing the provider size ceiling.
pub(crate) fn encode_task(
    task_type: &str,
    payload: Value,
    webhook_url: Option<String>,
) -> Result<(TaskMessage, String), QueueError> {
    let task = TaskMessage {
        task_id: Uuid::new_v4().to_string(),
        task_type: task_type.to_string(),
        payload,
        webhook_url,
        enqueued_at: current_timestamp_rfc3339(),
    };
    let body = serde_json::to_string(&task)?;
    let size = body.len();
    if size > MAX_MESSAGE_BYTES {
        return Err(QueueError::MessageTooLarge {
            size,
            limit: MAX_MESSAGE_BYTES,
        });
    }
    Ok((task, body))
}
