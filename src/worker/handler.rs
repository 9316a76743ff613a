//! Handler contract and the closed task-type registry.

use crate::queue::types::TaskStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Closed set of task types the worker knows how to execute.
///
/// The wire format carries the discriminator as a string; parsing it into this enum at
/// dispatch time turns an unrecognized type into an explicit terminal failure instead
/// of a silent no-op or an endlessly redelivered poison message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Document ingestion into the vector store.
    Ingest,
    /// Document summarization.
    Summarize,
}

impl TaskKind {
    /// Wire representation of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Summarize => "summarize",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingest" => Ok(Self::Ingest),
            "summarize" => Ok(Self::Summarize),
            _ => Err(()),
        }
    }
}

/// Errors surfaced by task handlers or the dispatch harness around them.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business-logic failure with handler-provided detail.
    #[error("{0}")]
    Failed(String),
    /// Handler observed the cancellation signal and stopped early.
    #[error("Task cancelled before completion")]
    Cancelled,
    /// The execution deadline fired before the handler finished.
    #[error("Task exceeded timeout of {0} seconds")]
    Timeout(u64),
}

/// The boundary where long-running business logic plugs into the pipeline.
///
/// Handlers receive the task payload and a cancellation token; they should observe the
/// token at natural suspension points so a deadline can cancel them cooperatively.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute the task, returning a result string or a structured failure.
    async fn execute(
        &self,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<String, HandlerError>;
}

/// Static mapping from task kind to handler, fixed at construction time.
pub struct HandlerRegistry {
    ingest: Arc<dyn TaskHandler>,
    summarize: Arc<dyn TaskHandler>,
}

impl HandlerRegistry {
    /// Build the registry with one handler per supported task kind.
    pub fn new(ingest: Arc<dyn TaskHandler>, summarize: Arc<dyn TaskHandler>) -> Self {
        Self { ingest, summarize }
    }

    /// Resolve the handler for a task kind. Total over the closed enum.
    pub fn handler_for(&self, kind: TaskKind) -> Arc<dyn TaskHandler> {
        match kind {
            TaskKind::Ingest => Arc::clone(&self.ingest),
            TaskKind::Summarize => Arc::clone(&self.summarize),
        }
    }
}

/// Terminal outcome reported for a task via status records and webhooks.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// `Completed` or `Failed`.
    pub status: TaskStatus,
    /// Handler result for completed tasks.
    pub result: Option<String>,
    /// Failure detail for failed tasks.
    pub error: Option<String>,
}

impl TaskOutcome {
    /// Successful outcome carrying the handler result.
    pub fn completed(result: String) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    /// Failed outcome carrying the error detail.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Whether the task finished successfully.
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
