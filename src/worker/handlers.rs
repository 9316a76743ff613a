//! Handlers shipped with the worker binary.
//!
//! Ingestion and summarization business logic lives behind dedicated backend services;
//! the worker forwards the task payload over HTTP and reports the service's response
//! as the task result. This keeps the pipeline opaque to document processing details
//! while still exercising the full dispatch contract.

use crate::config::{ConfigError, get_config};
use crate::worker::handler::{HandlerError, HandlerRegistry, TaskHandler};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BACKEND_TIMEOUT: Duration = Duration::from_secs(1800);

/// Handler that forwards the task payload to a backend service endpoint.
pub struct BackendServiceHandler {
    client: Client,
    endpoint: String,
}

impl BackendServiceHandler {
    /// Build a handler posting payloads to `endpoint`.
    pub fn new(client: Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl TaskHandler for BackendServiceHandler {
    async fn execute(
        &self,
        payload: Value,
        cancel: CancellationToken,
    ) -> Result<String, HandlerError> {
        let request = self.client.post(&self.endpoint).json(&payload).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HandlerError::Cancelled),
            response = request => {
                response.map_err(|err| HandlerError::Failed(format!("backend request failed: {err}")))?
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(HandlerError::Failed(format!(
                "backend returned {status}: {body}"
            )));
        }
        Ok(body)
    }
}

/// Build the default registry from `INGEST_SERVICE_URL` and `SUMMARIZE_SERVICE_URL`.
pub fn registry_from_config() -> Result<HandlerRegistry, ConfigError> {
    let config = get_config();
    let ingest_url = config
        .ingest_service_url
        .clone()
        .ok_or_else(|| ConfigError::MissingVariable("INGEST_SERVICE_URL".to_string()))?;
    let summarize_url = config
        .summarize_service_url
        .clone()
        .ok_or_else(|| ConfigError::MissingVariable("SUMMARIZE_SERVICE_URL".to_string()))?;

    let client = Client::builder()
        .user_agent("taskpipe-worker/0.1")
        .timeout(BACKEND_TIMEOUT)
        .build()
        .map_err(|_| ConfigError::InvalidValue("backend HTTP client".to_string()))?;

    tracing::debug!(
        ingest = %ingest_url,
        summarize = %summarize_url,
        "Configured backend service handlers"
    );
    Ok(HandlerRegistry::new(
        Arc::new(BackendServiceHandler::new(client.clone(), ingest_url)),
        Arc::new(BackendServiceHandler::new(client, summarize_url)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    #[tokio::test]
    async fn forwards_payload_and_returns_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/ingest")
                    .json_body(json!({"filename": "doc.pdf"}));
                then.status(200).body("Indexed doc.pdf: 3 chunks.");
            })
            .await;

        let handler = BackendServiceHandler::new(
            Client::new(),
            format!("{}/ingest", server.base_url()),
        );
        let result = handler
            .execute(json!({"filename": "doc.pdf"}), CancellationToken::new())
            .await
            .expect("execute");

        mock.assert();
        assert_eq!(result, "Indexed doc.pdf: 3 chunks.");
    }

    #[tokio::test]
    async fn non_success_status_is_a_handler_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/summarize");
                then.status(502).body("upstream unavailable");
            })
            .await;

        let handler = BackendServiceHandler::new(
            Client::new(),
            format!("{}/summarize", server.base_url()),
        );
        let err = handler
            .execute(json!({}), CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handler =
            BackendServiceHandler::new(Client::new(), "http://127.0.0.1:9/ingest".to_string());
        let err = handler
            .execute(json!({}), cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, HandlerError::Cancelled));
    }
}
