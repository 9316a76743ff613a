//! HTTP client for the durable cloud queue service.
//!
//! The service exposes a small REST surface: named queues holding opaque message
//! bodies with pop-receipt leases, plus a task-status store keyed by task id. Transient
//! submission failures are retried with bounded backoff; connectivity failures surface
//! as [`QueueError::ProviderUnavailable`] so callers can degrade explicitly.

use crate::config::get_config;
use crate::queue::provider::{QueueProvider, QueueTransport, encode_task};
use crate::queue::types::{
    MessageReceipt, QueueError, ReceivedMessage, TaskMessage, TaskStatusRecord,
};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// Lightweight HTTP client for the cloud queue REST API.
pub struct CloudQueue {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) queue_name: String,
    pub(crate) retry: RetryPolicy,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Deserialize)]
struct ReceiveResponse {
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct WireMessage {
    message_id: String,
    pop_receipt: String,
    #[serde(default)]
    dequeue_count: u32,
    body: String,
}

#[derive(Deserialize)]
struct VisibilityResponse {
    pop_receipt: String,
}

impl CloudQueue {
    /// Construct a new client using configuration derived from the environment.
    pub fn from_config() -> Result<Self, QueueError> {
        let config = get_config();
        let base_url = config
            .queue_service_url
            .clone()
            .ok_or_else(|| QueueError::ProviderUnavailable("QUEUE_SERVICE_URL not set".into()))?;
        Self::new(
            &base_url,
            config.queue_api_key.clone(),
            config.queue_name(),
        )
    }

    /// Construct a client against an explicit endpoint.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        queue_name: String,
    ) -> Result<Self, QueueError> {
        let client = Client::builder()
            .user_agent("taskpipe/0.1")
            .build()
            .map_err(|err| QueueError::ProviderUnavailable(err.to_string()))?;
        let base_url = normalize_base_url(base_url)?;
        tracing::debug!(url = %base_url, queue = %queue_name, "Initialized cloud queue client");
        Ok(Self {
            client,
            base_url,
            api_key,
            queue_name,
            retry: RetryPolicy::transport(),
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, QueueError> {
        let mut schedule = self.retry.schedule();
        loop {
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(err) => match schedule.next() {
                    Some(delay) => {
                        tracing::warn!(
                            attempt = schedule.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Queue request failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(QueueError::ProviderUnavailable(err.to_string())),
                },
            }
        }
    }

    async fn unexpected(response: reqwest::Response) -> QueueError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        QueueError::UnexpectedStatus { status, body }
    }
}

#[async_trait]
impl QueueProvider for CloudQueue {
    async fn submit(
        &self,
        task_type: &str,
        payload: Value,
        webhook_url: Option<String>,
    ) -> Result<String, QueueError> {
        let (task, body) = encode_task(task_type, payload, webhook_url)?;

        let path = format!("queues/{}/messages", self.queue_name);
        let response = self
            .send_with_retry(|| {
                self.request(Method::POST, &path)
                    .json(&json!({ "body": body }))
            })
            .await?;
        if !response.status().is_success() {
            let error = Self::unexpected(response).await;
            tracing::error!(task_type, error = %error, "Failed to submit task");
            return Err(error);
        }
        let accepted: SendResponse = response
            .json()
            .await
            .map_err(|err| QueueError::ProviderUnavailable(err.to_string()))?;

        self.record_status(TaskStatusRecord {
            task_id: task.task_id.clone(),
            status: crate::queue::types::TaskStatus::Queued,
            result: None,
            error: None,
        })
        .await?;

        tracing::info!(
            task_id = %task.task_id,
            task_type,
            message_id = %accepted.message_id,
            "Task submitted"
        );
        Ok(task.task_id)
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatusRecord, QueueError> {
        let response = self
            .request(Method::GET, &format!("tasks/{task_id}"))
            .send()
            .await
            .map_err(|err| QueueError::ProviderUnavailable(err.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(QueueError::UnknownTask(task_id.to_string())),
            status if status.is_success() => response
                .json()
                .await
                .map_err(|err| QueueError::ProviderUnavailable(err.to_string())),
            _ => Err(Self::unexpected(response).await),
        }
    }

    async fn record_status(&self, record: TaskStatusRecord) -> Result<(), QueueError> {
        let path = format!("tasks/{}", record.task_id);
        let response = self
            .send_with_retry(|| self.request(Method::PUT, &path).json(&record))
            .await?;
        if !response.status().is_success() {
            let error = Self::unexpected(response).await;
            tracing::error!(task_id = %record.task_id, error = %error, "Failed to record task status");
            return Err(error);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for CloudQueue {
    async fn receive(
        &self,
        max_messages: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let path = format!("queues/{}/messages", self.queue_name);
        let max = max_messages.to_string();
        let vis = visibility.as_secs().to_string();
        let response = self
            .send_with_retry(|| {
                self.request(Method::GET, &path)
                    .query(&[("max", max.as_str()), ("visibility", vis.as_str())])
            })
            .await?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }

        let wire: ReceiveResponse = response
            .json()
            .await
            .map_err(|err| QueueError::ProviderUnavailable(err.to_string()))?;

        let mut received = Vec::with_capacity(wire.messages.len());
        for message in wire.messages {
            match serde_json::from_str::<TaskMessage>(&message.body) {
                Ok(task) => received.push(ReceivedMessage {
                    receipt: MessageReceipt {
                        message_id: message.message_id,
                        pop_receipt: message.pop_receipt,
                    },
                    task,
                    dequeue_count: message.dequeue_count.max(1),
                }),
                Err(err) => {
                    // Undecodable body: leave it leased for the provider's own
                    // dead-letter handling rather than acknowledging blindly.
                    tracing::warn!(
                        message_id = %message.message_id,
                        error = %err,
                        "Skipping message with undecodable body"
                    );
                }
            }
        }
        Ok(received)
    }

    async fn delete(&self, receipt: &MessageReceipt) -> Result<(), QueueError> {
        let path = format!(
            "queues/{}/messages/{}",
            self.queue_name, receipt.message_id
        );
        let response = self
            .send_with_retry(|| {
                self.request(Method::DELETE, &path)
                    .query(&[("pop_receipt", receipt.pop_receipt.as_str())])
            })
            .await?;
        if !response.status().is_success() {
            let error = Self::unexpected(response).await;
            tracing::error!(message_id = %receipt.message_id, error = %error, "Failed to delete message");
            return Err(error);
        }
        tracing::debug!(message_id = %receipt.message_id, "Message acknowledged");
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &MessageReceipt,
        visibility: Duration,
    ) -> Result<MessageReceipt, QueueError> {
        let path = format!(
            "queues/{}/messages/{}/visibility",
            self.queue_name, receipt.message_id
        );
        let response = self
            .request(Method::PUT, &path)
            .json(&json!({
                "pop_receipt": receipt.pop_receipt,
                "visibility": visibility.as_secs(),
            }))
            .send()
            .await
            .map_err(|err| QueueError::ProviderUnavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(Self::unexpected(response).await);
        }
        let renewed: VisibilityResponse = response
            .json()
            .await
            .map_err(|err| QueueError::ProviderUnavailable(err.to_string()))?;
        Ok(MessageReceipt {
            message_id: receipt.message_id.clone(),
            pop_receipt: renewed.pop_receipt,
        })
    }
}

fn normalize_base_url(url: &str) -> Result<String, QueueError> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|err| QueueError::ProviderUnavailable(format!("invalid queue URL: {err}")))?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}
