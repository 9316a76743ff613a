//! Webhook delivery of task outcomes to the serving tier.
//!
//! Delivery is best-effort: transient failures are retried with bounded backoff, and
//! exhausting the budget drops the notification with a log line. The task itself has
//! already completed by then, so a lost notification never re-queues work; clients
//! reconcile through the status API instead.

use crate::retry::RetryPolicy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised when a notification could not be delivered.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Every delivery attempt failed; the notification was dropped.
    #[error("Webhook delivery failed after {attempts} attempts: {detail}")]
    DeliveryFailed {
        /// Attempts performed before giving up.
        attempts: u32,
        /// Last observed failure.
        detail: String,
    },
}

/// Body POSTed to the webhook receiver when a task finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNotification {
    /// Identifier of the finished task.
    pub task_id: String,
    /// Task discriminator, serialized as `type` on the wire.
    #[serde(rename = "type")]
    pub task_type: String,
    /// Filename the task operated on, when the payload carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Terminal status: `completed` or `failed`.
    pub status: String,
    /// Handler result for completed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure detail for failed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// POSTs completion/failure notifications with bounded retry.
pub struct NotificationDispatcher {
    client: Client,
    retry: RetryPolicy,
}

impl NotificationDispatcher {
    /// Build a dispatcher with the default transport retry policy.
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::transport())
    }

    /// Build a dispatcher with an explicit retry policy.
    pub fn with_policy(retry: RetryPolicy) -> Self {
        let client = Client::builder()
            .user_agent("taskpipe/0.1")
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client, retry }
    }

    /// Deliver a notification to `webhook_url`, retrying transient failures.
    pub async fn notify(
        &self,
        webhook_url: &str,
        notification: &TaskNotification,
    ) -> Result<(), NotifyError> {
        let mut schedule = self.retry.schedule();
        loop {
            let failure = match self.client.post(webhook_url).json(notification).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(
                        task_id = %notification.task_id,
                        status = %notification.status,
                        "Webhook delivered"
                    );
                    return Ok(());
                }
                Ok(response) => format!("unexpected status {}", response.status()),
                Err(err) => err.to_string(),
            };

            match schedule.next() {
                Some(delay) => {
                    tracing::warn!(
                        task_id = %notification.task_id,
                        attempt = schedule.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        failure = %failure,
                        "Webhook delivery failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    let attempts = schedule.attempts();
                    tracing::error!(
                        task_id = %notification.task_id,
                        attempts,
                        failure = %failure,
                        "Webhook delivery failed; dropping notification"
                    );
                    return Err(NotifyError::DeliveryFailed {
                        attempts,
                        detail: failure,
                    });
                }
            }
        }
    }
}

impl Default for NotificationDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
