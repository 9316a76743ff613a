//! The worker loop: receive, dispatch, notify, acknowledge.
//!
//! One consumer core backs both operating modes. Continuous mode polls the queue
//! transport until a shutdown signal is observed between iterations; single-task mode
//! executes one task description read from a fixed input and reports its outcome to
//! the caller, which maps it to a process exit status.
//!
//! Delivery semantics: a message is deleted only after its handler finished
//! successfully, or when its failure is terminal (unrecognized task type, exhausted
//! delivery budget). Retryable failures leave the message leased so the visibility
//! timeout redelivers it to some consumer later.

use crate::config::get_config;
use crate::notify::{NotificationDispatcher, TaskNotification};
use crate::queue::provider::{QueueProvider, QueueTransport};
use crate::queue::types::{
    MessageReceipt, QueueError, ReceivedMessage, TaskMessage, TaskStatus, TaskStatusRecord,
    current_timestamp_rfc3339,
};
use crate::worker::handler::{HandlerError, HandlerRegistry, TaskKind, TaskOutcome};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Deliveries allowed per message before a persistently failing task is dropped.
///
/// Guards against poison messages: the visibility timeout redelivers retryable
/// failures, and without a budget a task that always fails would loop forever.
const MAX_DELIVERIES: u32 = 5;

/// Tunables controlling the receive/dispatch cycle.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    /// Sleep between empty receive attempts.
    pub polling_interval: Duration,
    /// Visibility window requested per receive; also the lease renewed by heartbeats.
    pub visibility_timeout: Duration,
    /// Overall deadline for one task execution.
    pub task_timeout: Duration,
    /// Messages fetched per receive call.
    pub max_messages: usize,
}

impl ConsumerSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config() -> Self {
        let config = get_config();
        Self {
            polling_interval: Duration::from_secs(config.worker_polling_interval_secs),
            visibility_timeout: Duration::from_secs(config.worker_visibility_timeout_secs),
            task_timeout: Duration::from_secs(config.worker_task_timeout_secs),
            max_messages: config.worker_max_messages,
        }
    }
}

/// Outcome plus the disposition the transport should apply to the message.
struct ProcessedTask {
    outcome: TaskOutcome,
    /// Terminal tasks are acknowledged regardless of status; non-terminal failures
    /// stay on the queue for redelivery.
    terminal: bool,
}

/// Queue consumer shared by continuous and single-task modes.
pub struct Consumer {
    transport: Arc<dyn QueueTransport>,
    statuses: Arc<dyn QueueProvider>,
    registry: HandlerRegistry,
    dispatcher: NotificationDispatcher,
    settings: ConsumerSettings,
}

impl Consumer {
    /// Assemble a consumer from its collaborators.
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        statuses: Arc<dyn QueueProvider>,
        registry: HandlerRegistry,
        dispatcher: NotificationDispatcher,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            transport,
            statuses,
            registry,
            dispatcher,
            settings,
        }
    }

    /// Run the continuous polling loop until `shutdown` resolves.
    ///
    /// The signal is only observed between iterations: an in-flight task always runs
    /// to completion (or its deadline) before the loop exits.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        tracing::info!(
            polling_interval_secs = self.settings.polling_interval.as_secs(),
            visibility_timeout_secs = self.settings.visibility_timeout.as_secs(),
            task_timeout_secs = self.settings.task_timeout.as_secs(),
            max_messages = self.settings.max_messages,
            "Worker loop starting"
        );
        tokio::pin!(shutdown);

        loop {
            let batch = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal observed; stopping");
                    break;
                }
                batch = self.transport.receive(
                    self.settings.max_messages,
                    self.settings.visibility_timeout,
                ) => batch,
            };

            let idle = match batch {
                Ok(messages) if messages.is_empty() => true,
                Ok(messages) => {
                    tracing::debug!(count = messages.len(), "Received messages");
                    for message in messages {
                        self.handle_message(message).await;
                    }
                    false
                }
                Err(err) => {
                    // Transport-level errors abort this cycle and retry next poll.
                    tracing::error!(error = %err, "Receive failed; backing off");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = &mut shutdown => {
                        tracing::info!("Shutdown signal observed; stopping");
                        break;
                    }
                    _ = tokio::time::sleep(self.settings.polling_interval) => {}
                }
            }
        }
        tracing::info!("Worker stopped");
    }

    /// Receive and process one batch without sleeping. Used by single-shot drivers.
    pub async fn poll_once(&self) -> Result<usize, QueueError> {
        let messages = self
            .transport
            .receive(self.settings.max_messages, self.settings.visibility_timeout)
            .await?;
        let count = messages.len();
        for message in messages {
            self.handle_message(message).await;
        }
        Ok(count)
    }

    /// Execute one task description read from a fixed input (single-task mode).
    ///
    /// Accepts either a bare JSON task or the legacy `task_id|{json}` framing. The
    /// webhook is emitted exactly as in continuous mode; the returned outcome drives
    /// the process exit status.
    pub async fn run_single(&self, raw: &str) -> Result<TaskOutcome, QueueError> {
        let task = parse_task_data(raw)?;
        tracing::info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            timeout_secs = self.settings.task_timeout.as_secs(),
            "Single-task mode"
        );
        let processed = self.process(&task).await;
        Ok(processed.outcome)
    }

    /// Process a received message and apply its disposition to the transport.
    async fn handle_message(&self, message: ReceivedMessage) {
        let task_id = message.task.task_id.clone();
        let mut receipt = message.receipt.clone();

        let processed = self.process_with_heartbeat(&message.task, &mut receipt).await;

        let over_budget = message.dequeue_count >= MAX_DELIVERIES;
        let acknowledge = processed.terminal || processed.outcome.is_completed() || over_budget;
        if over_budget && !processed.outcome.is_completed() && !processed.terminal {
            tracing::error!(
                task_id = %task_id,
                deliveries = message.dequeue_count,
                "Delivery budget exhausted; dropping message"
            );
        }

        if acknowledge {
            if let Err(err) = self.transport.delete(&receipt).await {
                tracing::error!(task_id = %task_id, error = %err, "Failed to acknowledge message");
            }
        } else {
            tracing::warn!(
                task_id = %task_id,
                deliveries = message.dequeue_count,
                "Task failed; leaving message for redelivery"
            );
        }
    }

    /// Run `process` while renewing the message lease at half the visibility window.
    async fn process_with_heartbeat(
        &self,
        task: &TaskMessage,
        receipt: &mut MessageReceipt,
    ) -> ProcessedTask {
        let period = (self.settings.visibility_timeout / 2).max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await; // consume the immediate first tick

        let process = self.process(task);
        tokio::pin!(process);

        loop {
            tokio::select! {
                processed = &mut process => return processed,
                _ = heartbeat.tick() => {
                    match self
                        .transport
                        .extend_visibility(receipt, self.settings.visibility_timeout)
                        .await
                    {
                        Ok(renewed) => {
                            tracing::trace!(task_id = %task.task_id, "Lease renewed");
                            *receipt = renewed;
                        }
                        Err(err) => {
                            // Losing the lease risks duplicate processing; keep going
                            // and let the receipt check catch it at acknowledge time.
                            tracing::warn!(
                                task_id = %task.task_id,
                                error = %err,
                                "Failed to renew message lease"
                            );
                        }
                    }
                }
            }
        }
    }

    /// Route a task to its handler under the execution deadline and report the outcome.
    async fn process(&self, task: &TaskMessage) -> ProcessedTask {
        tracing::info!(task_id = %task.task_id, task_type = %task.task_type, "Processing task");
        self.record(task, TaskStatus::Processing, None, None).await;

        let processed = match task.task_type.parse::<TaskKind>() {
            Err(()) => {
                // Terminal: retrying an unknown type can never succeed.
                tracing::warn!(task_id = %task.task_id, task_type = %task.task_type, "Unknown task type");
                ProcessedTask {
                    outcome: TaskOutcome::failed(format!("Unknown task type: {}", task.task_type)),
                    terminal: true,
                }
            }
            Ok(kind) => {
                let outcome = self.dispatch(kind, task).await;
                ProcessedTask {
                    outcome,
                    terminal: false,
                }
            }
        };

        let outcome = &processed.outcome;
        self.record(
            task,
            outcome.status,
            outcome.result.clone(),
            outcome.error.clone(),
        )
        .await;
        self.send_webhook(task, outcome).await;

        tracing::info!(
            task_id = %task.task_id,
            status = outcome.status.as_str(),
            "Task finished"
        );
        processed
    }

    /// Execute the handler under the overall deadline with cooperative cancellation.
    async fn dispatch(&self, kind: TaskKind, task: &TaskMessage) -> TaskOutcome {
        let handler = self.registry.handler_for(kind);
        let cancel = CancellationToken::new();

        let attempt = handler.execute(task.payload.clone(), cancel.child_token());
        match tokio::time::timeout(self.settings.task_timeout, attempt).await {
            Ok(Ok(result)) => TaskOutcome::completed(result),
            Ok(Err(err)) => {
                tracing::warn!(task_id = %task.task_id, error = %err, "Handler failed");
                TaskOutcome::failed(err.to_string())
            }
            Err(_) => {
                // The handler future is already dropped; cancel the token so any work
                // it spawned observes the deadline too. Best-effort reclamation.
                cancel.cancel();
                let error = HandlerError::Timeout(self.settings.task_timeout.as_secs());
                tracing::error!(task_id = %task.task_id, error = %error, "Handler deadline exceeded");
                TaskOutcome::failed(error.to_string())
            }
        }
    }

    /// Advance the provider-side status record; failures here never fail the task.
    async fn record(
        &self,
        task: &TaskMessage,
        status: TaskStatus,
        result: Option<String>,
        error: Option<String>,
    ) {
        let record = TaskStatusRecord {
            task_id: task.task_id.clone(),
            status,
            result,
            error,
        };
        if let Err(err) = self.statuses.record_status(record).await {
            tracing::warn!(task_id = %task.task_id, error = %err, "Failed to record task status");
        }
    }

    /// Emit the completion/failure webhook when the task carries a callback URL.
    ///
    /// Delivery failure is logged and tolerated: the task itself already finished and
    /// clients reconcile through the status API.
    async fn send_webhook(&self, task: &TaskMessage, outcome: &TaskOutcome) {
        let Some(webhook_url) = task.webhook_url.as_deref() else {
            tracing::debug!(task_id = %task.task_id, "No webhook URL; skipping notification");
            return;
        };
        let notification = TaskNotification {
            task_id: task.task_id.clone(),
            task_type: task.task_type.clone(),
            filename: task
                .payload
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: outcome.status.as_str().to_string(),
            result: outcome.result.clone(),
            error: outcome.error.clone(),
        };
        if let Err(err) = self.dispatcher.notify(webhook_url, &notification).await {
            tracing::error!(task_id = %task.task_id, error = %err, "Notification dropped");
        }
    }
}

#[derive(Deserialize)]
struct RawTask {
    #[serde(default)]
    task_id: Option<String>,
    task_type: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    enqueued_at: Option<String>,
}

/// Parse a single-task description, tolerating the `task_id|{json}` queue framing.
fn parse_task_data(raw: &str) -> Result<TaskMessage, QueueError> {
    let (prefix_id, json_content) = match raw.split_once('|') {
        Some((task_id, json)) => (Some(task_id.to_string()), json),
        None => (None, raw),
    };
    let parsed: RawTask = serde_json::from_str(json_content)?;
    Ok(TaskMessage {
        task_id: parsed
            .task_id
            .or(prefix_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        task_type: parsed.task_type,
        payload: parsed.payload,
        webhook_url: parsed.webhook_url,
        enqueued_at: parsed
            .enqueued_at
            .unwrap_or_else(current_timestamp_rfc3339),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationDispatcher;
    use crate::queue::MockQueue;
    use crate::retry::RetryPolicy;
    use crate::worker::handler::{HandlerError, TaskHandler};
    use async_trait::async_trait;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct OkHandler(&'static str);

    #[async_trait]
    impl TaskHandler for OkHandler {
        async fn execute(
            &self,
            _payload: Value,
            _cancel: CancellationToken,
        ) -> Result<String, HandlerError> {
            Ok(self.0.to_string())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn execute(
            &self,
            _payload: Value,
            _cancel: CancellationToken,
        ) -> Result<String, HandlerError> {
            Err(HandlerError::Failed("conversion crashed".into()))
        }
    }

    /// Sleeps past any test deadline; spawns a watcher that records cancellation.
    struct SlowHandler {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskHandler for SlowHandler {
        async fn execute(
            &self,
            _payload: Value,
            cancel: CancellationToken,
        ) -> Result<String, HandlerError> {
            let cancelled = Arc::clone(&self.cancelled);
            tokio::spawn(async move {
                cancel.cancelled().await;
                cancelled.store(true, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".into())
        }
    }

    fn fast_settings() -> ConsumerSettings {
        ConsumerSettings {
            polling_interval: Duration::from_millis(10),
            visibility_timeout: Duration::from_secs(30),
            task_timeout: Duration::from_secs(5),
            max_messages: 10,
        }
    }

    fn fast_dispatcher() -> NotificationDispatcher {
        NotificationDispatcher::with_policy(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        })
    }

    fn consumer_with(
        queue: &Arc<MockQueue>,
        registry: HandlerRegistry,
        settings: ConsumerSettings,
    ) -> Consumer {
        Consumer::new(
            Arc::clone(queue) as Arc<dyn QueueTransport>,
            Arc::clone(queue) as Arc<dyn QueueProvider>,
            registry,
            fast_dispatcher(),
            settings,
        )
    }

    fn default_registry() -> HandlerRegistry {
        HandlerRegistry::new(
            Arc::new(OkHandler("Indexed doc.pdf: 3 chunks.")),
            Arc::new(OkHandler("Summary text")),
        )
    }

    #[tokio::test]
    async fn completed_task_is_acknowledged_and_notified() {
        let server = MockServer::start_async().await;
        let webhook = server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/notify");
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        let queue = Arc::new(MockQueue::new());
        let task_id = queue
            .submit(
                "summarize",
                json!({"filename": "doc.pdf"}),
                Some(format!("{}/internal/notify", server.base_url())),
            )
            .await
            .expect("submit");

        let consumer = consumer_with(&queue, default_registry(), fast_settings());
        let handled = consumer.poll_once().await.expect("poll");
        assert_eq!(handled, 1);

        webhook.assert();
        assert!(queue.is_empty(), "completed message must be deleted");
        let record = queue.status(&task_id).await.expect("status");
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("Summary text"));
    }

    #[tokio::test]
    async fn failing_handler_leaves_message_for_redelivery() {
        let server = MockServer::start_async().await;
        let webhook = server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/notify");
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        let queue = Arc::new(MockQueue::new());
        queue
            .submit(
                "ingest",
                json!({"filename": "doc.pdf"}),
                Some(format!("{}/internal/notify", server.base_url())),
            )
            .await
            .expect("submit");

        let registry =
            HandlerRegistry::new(Arc::new(FailingHandler), Arc::new(OkHandler("unused")));
        let consumer = consumer_with(&queue, registry, fast_settings());
        consumer.poll_once().await.expect("poll");

        webhook.assert_hits(1);
        assert_eq!(queue.len(), 1, "failed message must remain queued");

        // Lease lapse makes the same message deliverable again.
        queue.expire_visibility();
        let redelivered = queue
            .receive(10, Duration::from_secs(30))
            .await
            .expect("receive");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].dequeue_count, 2);
    }

    #[tokio::test]
    async fn unknown_task_type_is_terminal() {
        let server = MockServer::start_async().await;
        let webhook = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/internal/notify")
                    .json_body_partial(r#"{"status": "failed"}"#);
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        let queue = Arc::new(MockQueue::new());
        let task_id = queue
            .submit(
                "bogus",
                json!({}),
                Some(format!("{}/internal/notify", server.base_url())),
            )
            .await
            .expect("submit");

        let consumer = consumer_with(&queue, default_registry(), fast_settings());
        consumer.poll_once().await.expect("poll");

        webhook.assert_hits(1);
        assert!(queue.is_empty(), "poison message must be acknowledged");
        let record = queue.status(&task_id).await.expect("status");
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap_or("").contains("bogus"));
    }

    #[tokio::test]
    async fn deadline_cancels_handler_and_reports_timeout() {
        let server = MockServer::start_async().await;
        let webhook = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/internal/notify")
                    .json_body_partial(r#"{"status": "failed"}"#);
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        let queue = Arc::new(MockQueue::new());
        let task_id = queue
            .submit(
                "summarize",
                json!({"filename": "doc.pdf"}),
                Some(format!("{}/internal/notify", server.base_url())),
            )
            .await
            .expect("submit");

        let cancelled = Arc::new(AtomicBool::new(false));
        let registry = HandlerRegistry::new(
            Arc::new(OkHandler("unused")),
            Arc::new(SlowHandler {
                cancelled: Arc::clone(&cancelled),
            }),
        );
        let mut settings = fast_settings();
        settings.task_timeout = Duration::from_millis(50);

        let consumer = consumer_with(&queue, registry, settings);
        consumer.poll_once().await.expect("poll");

        webhook.assert_hits(1);
        let record = queue.status(&task_id).await.expect("status");
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error.as_deref().unwrap_or("").contains("timeout"));

        // The watcher spawned by the handler observes the cancelled token.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 1, "timed-out task stays for redelivery");
    }

    #[tokio::test]
    async fn delivery_budget_drops_persistent_failures() {
        let queue = Arc::new(MockQueue::new());
        queue
            .submit("ingest", json!({}), None)
            .await
            .expect("submit");

        let registry =
            HandlerRegistry::new(Arc::new(FailingHandler), Arc::new(OkHandler("unused")));
        let consumer = consumer_with(&queue, registry, fast_settings());

        for _ in 0..MAX_DELIVERIES {
            queue.expire_visibility();
            consumer.poll_once().await.expect("poll");
        }
        assert!(
            queue.is_empty(),
            "message must be dropped once the delivery budget is spent"
        );
    }

    #[tokio::test]
    async fn heartbeat_keeps_long_task_leased() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/notify");
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        struct NapHandler;

        #[async_trait]
        impl TaskHandler for NapHandler {
            async fn execute(
                &self,
                _payload: Value,
                _cancel: CancellationToken,
            ) -> Result<String, HandlerError> {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok("done".into())
            }
        }

        let queue = Arc::new(MockQueue::new());
        queue
            .submit(
                "ingest",
                json!({}),
                Some(format!("{}/internal/notify", server.base_url())),
            )
            .await
            .expect("submit");

        let registry = HandlerRegistry::new(Arc::new(NapHandler), Arc::new(OkHandler("unused")));
        let mut settings = fast_settings();
        settings.visibility_timeout = Duration::from_millis(100);

        let consumer = consumer_with(&queue, registry, settings);
        let poll = {
            let queue_probe = Arc::clone(&queue);
            tokio::spawn(async move {
                // Mid-flight the lease must still be held despite the short window.
                tokio::time::sleep(Duration::from_millis(150)).await;
                let concurrent = queue_probe
                    .receive(10, Duration::from_secs(30))
                    .await
                    .expect("receive");
                assert!(concurrent.is_empty(), "renewed lease must hide the message");
            })
        };

        consumer.poll_once().await.expect("poll");
        poll.await.expect("probe");
        // Delete with the renewed receipt succeeded.
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn run_single_reports_completed_outcome() {
        let server = MockServer::start_async().await;
        let webhook = server
            .mock_async(|when, then| {
                when.method(POST).path("/internal/notify");
                then.status(200).json_body(json!({"status": "ok"}));
            })
            .await;

        let queue = Arc::new(MockQueue::new());
        let consumer = consumer_with(&queue, default_registry(), fast_settings());

        let raw = json!({
            "task_type": "summarize",
            "payload": {"filename": "doc.pdf"},
            "webhook_url": format!("{}/internal/notify", server.base_url())
        })
        .to_string();

        let outcome = consumer.run_single(&raw).await.expect("run");
        assert!(outcome.is_completed());
        assert_eq!(outcome.result.as_deref(), Some("Summary text"));
        webhook.assert();
    }

    #[tokio::test]
    async fn run_single_rejects_invalid_input() {
        let queue = Arc::new(MockQueue::new());
        let consumer = consumer_with(&queue, default_registry(), fast_settings());
        assert!(consumer.run_single("not json").await.is_err());
    }

    #[test]
    fn parse_task_data_handles_prefixed_framing() {
        let task = parse_task_data(r#"abc-123|{"task_type":"ingest","payload":{"filename":"a.txt"}}"#)
            .expect("parse");
        assert_eq!(task.task_id, "abc-123");
        assert_eq!(task.task_type, "ingest");
        assert_eq!(task.payload["filename"], "a.txt");
        assert!(!task.enqueued_at.is_empty());
    }

    #[test]
    fn parse_task_data_generates_missing_ids() {
        let task = parse_task_data(r#"{"task_type":"summarize"}"#).expect("parse");
        assert!(!task.task_id.is_empty());
        assert!(task.webhook_url.is_none());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let queue = Arc::new(MockQueue::new());
        let consumer = consumer_with(&queue, default_registry(), fast_settings());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            consumer
                .run(async {
                    let _ = rx.await;
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop must exit promptly")
            .expect("join");
    }
}
