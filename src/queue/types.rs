//! Shared types used by the queue providers and the worker.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors returned while interacting with a queue provider.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue transport was unreachable or rejected the connection.
    #[error("Queue provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Serialized message exceeds the provider's size ceiling.
    #[error("Message too large: {size} bytes (max {limit} bytes)")]
    MessageTooLarge {
        /// Serialized message size in bytes.
        size: usize,
        /// Provider ceiling in bytes.
        limit: usize,
    },
    /// Provider responded with an unexpected status code.
    #[error("Unexpected queue response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the provider.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Task message failed to serialize or deserialize.
    #[error("Failed to encode task message: {0}")]
    Encode(#[from] serde_json::Error),
    /// No status record exists for the requested task.
    #[error("Unknown task: {0}")]
    UnknownTask(String),
}

/// The unit of dispatch placed on the queue by the submitter.
///
/// `task_type` stays a string at the transport boundary; the worker parses it into the
/// closed [`crate::worker::TaskKind`] enum at dispatch time so an unrecognized type is an
/// explicit terminal error rather than a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Globally unique identifier assigned at submission time.
    pub task_id: String,
    /// Discriminator selecting a handler (e.g. `ingest`, `summarize`).
    pub task_type: String,
    /// Handler-specific structured data. Metadata only; large content is referenced by
    /// location, never embedded, to stay under the provider's message-size ceiling.
    pub payload: Value,
    /// Callback endpoint the worker notifies on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// RFC3339 timestamp set by the submitter.
    pub enqueued_at: String,
}

/// Processing state advertised through the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted by the provider, not yet picked up by a worker.
    Queued,
    /// A worker is currently executing the task.
    Processing,
    /// Handler finished successfully.
    Completed,
    /// Handler failed, timed out, or the task type was unrecognized.
    Failed,
}

impl TaskStatus {
    /// Wire representation used in webhook bodies and status responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Status record maintained by the provider for client polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    /// Task identifier the record describes.
    pub task_id: String,
    /// Current processing state.
    pub status: TaskStatus,
    /// Handler result, present once the task completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure detail, present once the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opaque handle required to delete or re-lease a received message.
#[derive(Debug, Clone)]
pub struct MessageReceipt {
    /// Provider-assigned message identifier.
    pub message_id: String,
    /// Proof of the current lease; invalidated when the visibility timeout expires.
    pub pop_receipt: String,
}

/// A message pulled off the queue together with its delivery metadata.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Handle for acknowledging or extending the lease on this delivery.
    pub receipt: MessageReceipt,
    /// Decoded task description.
    pub task: TaskMessage,
    /// Number of times this message has been delivered, including this one.
    pub dequeue_count: u32,
}

/// Current UTC time formatted as RFC3339.
pub fn current_timestamp_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
