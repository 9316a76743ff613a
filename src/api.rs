//! HTTP surface for the task pipeline serving tier.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /tasks` – Submit a task for asynchronous execution. Accepts a task type,
//!   an arbitrary JSON payload, and an optional webhook URL; returns the assigned
//!   `task_id` immediately.
//! - `GET /tasks/:task_id` – Look up the current status record for a submitted task.
//! - `POST /internal/notify` – Webhook receiver the worker posts task outcomes to;
//!   outcomes are appended to the in-memory notification queue for polling clients.
//! - `GET /poll` – Long-poll for notification events newer than a client cursor.
//! - `GET /health` – Liveness probe.
//!
//! The same router serves browser clients and the worker's callback, so delivery
//! events flow through one process without extra infrastructure.

use crate::config::get_config;
use crate::notify::{NotificationQueue, TaskNotification};
use crate::queue::{QueueError, QueueProvider};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Queue backend used for task submission and status lookups.
    pub provider: Arc<dyn QueueProvider>,
    /// Event buffer bridging worker callbacks to long-polling clients.
    pub notifications: Arc<NotificationQueue>,
}

/// Build the HTTP router exposing the task pipeline API surface.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/:task_id", get(task_status))
        .route("/internal/notify", post(receive_notification))
        .route("/poll", get(poll_notifications))
        .route("/health", get(health))
        .with_state(state)
}

/// Request body for the `POST /tasks` endpoint.
#[derive(Deserialize)]
struct SubmitRequest {
    /// Task discriminator routed to a worker handler (`ingest` | `summarize`).
    task_type: String,
    /// Arbitrary JSON payload forwarded to the handler.
    #[serde(default)]
    payload: Value,
    /// Optional callback override (defaults to `NOTIFY_WEBHOOK_URL`).
    #[serde(default)]
    webhook_url: Option<String>,
}

/// Success response for the `POST /tasks` endpoint.
#[derive(Serialize)]
struct SubmitResponse {
    task_id: String,
}

/// Submit a task to the queue and return its identifier.
async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    let webhook_url = request
        .webhook_url
        .or_else(|| get_config().notify_webhook_url.clone());
    let task_id = state
        .provider
        .submit(&request.task_type, request.payload, webhook_url)
        .await?;
    tracing::info!(task_id = %task_id, task_type = %request.task_type, "Task accepted");
    Ok(Json(SubmitResponse { task_id }))
}

/// Look up the status record for a task.
async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<crate::queue::TaskStatusRecord>, AppError> {
    let record = state.provider.status(&task_id).await?;
    Ok(Json(record))
}

/// Accept a task outcome from the worker and enqueue it for polling clients.
async fn receive_notification(
    State(state): State<AppState>,
    Json(notification): Json<TaskNotification>,
) -> Json<Value> {
    let data = serde_json::to_value(&notification)
        .unwrap_or_else(|_| json!({"task_id": notification.task_id}));
    let id = state.notifications.push(data);
    tracing::debug!(
        task_id = %notification.task_id,
        status = %notification.status,
        event_id = id,
        "Notification received"
    );
    Json(json!({"status": "ok"}))
}

/// Query parameters for the `GET /poll` endpoint.
#[derive(Deserialize)]
struct PollQuery {
    /// Cursor: only events with a strictly greater id are returned.
    #[serde(default)]
    since_id: u64,
}

/// Response body for `GET /poll`.
#[derive(Serialize)]
struct PollResponse {
    messages: Vec<crate::notify::NotificationEvent>,
}

/// Wait up to the configured long-poll window for events newer than the cursor.
async fn poll_notifications(
    State(state): State<AppState>,
    Query(query): Query<PollQuery>,
) -> Json<PollResponse> {
    let timeout = Duration::from_secs(get_config().poll_timeout_secs);
    let messages = state.notifications.get_since(query.since_id, timeout).await;
    Json(PollResponse { messages })
}

/// Liveness probe.
async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

struct AppError(QueueError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::UnknownTask(_) => StatusCode::NOT_FOUND,
            QueueError::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            QueueError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

impl From<QueueError> for AppError {
    fn from(inner: QueueError) -> Self {
        Self(inner)
    }
}
