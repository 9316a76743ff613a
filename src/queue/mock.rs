//! In-memory queue used for development and tests.
//!
//! Unlike the cloud transport this backend keeps everything in process memory, but it
//! models the same delivery semantics: received messages become invisible for the
//! requested visibility window, deletes require the receipt issued by the most recent
//! receive, and undeleted messages are redelivered once their lease lapses.

use crate::queue::provider::{QueueProvider, QueueTransport, encode_task};
use crate::queue::types::{
    MessageReceipt, QueueError, ReceivedMessage, TaskMessage, TaskStatus, TaskStatusRecord,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct StoredMessage {
    message_id: String,
    pop_receipt: String,
    task: TaskMessage,
    visible_at: Instant,
    dequeue_count: u32,
}

#[derive(Default)]
struct MockState {
    messages: Vec<StoredMessage>,
    statuses: HashMap<String, TaskStatusRecord>,
}

/// In-memory queue implementing both the provider and transport contracts.
#[derive(Default)]
pub struct MockQueue {
    state: Mutex<MockState>,
}

impl MockQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently stored, whether visible or leased.
    pub fn len(&self) -> usize {
        self.state.lock().expect("mock queue lock").messages.len()
    }

    /// Whether the queue holds no messages at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force every outstanding lease to lapse immediately.
    ///
    /// Test hook simulating a consumer crash: the next receive call redelivers every
    /// message that was held but never deleted.
    pub fn expire_visibility(&self) {
        let mut state = self.state.lock().expect("mock queue lock");
        let now = Instant::now();
        for message in &mut state.messages {
            message.visible_at = now;
        }
    }

    fn find_leased<'a>(
        state: &'a mut MockState,
        receipt: &MessageReceipt,
    ) -> Result<&'a mut StoredMessage, QueueError> {
        let now = Instant::now();
        let message = state
            .messages
            .iter_mut()
            .find(|message| message.message_id == receipt.message_id)
            .ok_or_else(|| QueueError::UnknownTask(receipt.message_id.clone()))?;
        // A lapsed lease means another consumer may already hold this message.
        if message.pop_receipt != receipt.pop_receipt || message.visible_at <= now {
            return Err(QueueError::UnexpectedStatus {
                status: StatusCode::CONFLICT,
                body: format!("stale receipt for message {}", receipt.message_id),
            });
        }
        Ok(message)
    }
}

#[async_trait]
impl QueueProvider for MockQueue {
    async fn submit(
        &self,
        task_type: &str,
        payload: Value,
        webhook_url: Option<String>,
    ) -> Result<String, QueueError> {
        let (task, _body) = encode_task(task_type, payload, webhook_url)?;
        let task_id = task.task_id.clone();

        let mut state = self.state.lock().expect("mock queue lock");
        state.statuses.insert(
            task_id.clone(),
            TaskStatusRecord {
                task_id: task_id.clone(),
                status: TaskStatus::Queued,
                result: None,
                error: None,
            },
        );
        state.messages.push(StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            pop_receipt: Uuid::new_v4().to_string(),
            task,
            visible_at: Instant::now(),
            dequeue_count: 0,
        });
        tracing::debug!(task_id = %task_id, task_type, "Task submitted to mock queue");
        Ok(task_id)
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatusRecord, QueueError> {
        let state = self.state.lock().expect("mock queue lock");
        state
            .statuses
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::UnknownTask(task_id.to_string()))
    }

    async fn record_status(&self, record: TaskStatusRecord) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("mock queue lock");
        state.statuses.insert(record.task_id.clone(), record);
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for MockQueue {
    async fn receive(
        &self,
        max_messages: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut state = self.state.lock().expect("mock queue lock");
        let now = Instant::now();
        let mut received = Vec::new();

        for message in &mut state.messages {
            if received.len() >= max_messages {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.dequeue_count += 1;
            message.pop_receipt = Uuid::new_v4().to_string();
            message.visible_at = now + visibility;
            received.push(ReceivedMessage {
                receipt: MessageReceipt {
                    message_id: message.message_id.clone(),
                    pop_receipt: message.pop_receipt.clone(),
                },
                task: message.task.clone(),
                dequeue_count: message.dequeue_count,
            });
        }

        Ok(received)
    }

    async fn delete(&self, receipt: &MessageReceipt) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("mock queue lock");
        Self::find_leased(&mut state, receipt)?;
        state
            .messages
            .retain(|message| message.message_id != receipt.message_id);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &MessageReceipt,
        visibility: Duration,
    ) -> Result<MessageReceipt, QueueError> {
        let mut state = self.state.lock().expect("mock queue lock");
        let message = Self::find_leased(&mut state, receipt)?;
        message.pop_receipt = Uuid::new_v4().to_string();
        message.visible_at = Instant::now() + visibility;
        Ok(MessageReceipt {
            message_id: message.message_id.clone(),
            pop_receipt: message.pop_receipt.clone(),
        })
    }
}
