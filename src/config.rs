use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration shared by the serving tier and the worker.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Queue backend used for task dispatch.
    pub queue_backend: QueueBackend,
    /// Base URL of the cloud queue service (required when the backend is `cloud`).
    pub queue_service_url: Option<String>,
    /// Optional API key required to access the cloud queue service.
    pub queue_api_key: Option<String>,
    /// Client identifier used to isolate queues per deployment (`{client_id}-tasks`).
    pub client_id: String,
    /// Default webhook URL attached to submissions that do not carry their own.
    pub notify_webhook_url: Option<String>,
    /// Seconds the worker sleeps between empty receive attempts.
    pub worker_polling_interval_secs: u64,
    /// Visibility timeout requested for each received message, in seconds.
    pub worker_visibility_timeout_secs: u64,
    /// Overall deadline for a single task execution, in seconds.
    pub worker_task_timeout_secs: u64,
    /// Maximum messages fetched per receive call.
    pub worker_max_messages: usize,
    /// Raw task description consumed in single-task mode instead of the queue.
    pub task_data: Option<String>,
    /// Backend service executing ingestion work on behalf of the worker.
    pub ingest_service_url: Option<String>,
    /// Backend service executing summarization work on behalf of the worker.
    pub summarize_service_url: Option<String>,
    /// Maximum events retained by the in-memory notification queue.
    pub notify_retention: usize,
    /// Server-side wait applied to long-poll requests, in seconds.
    pub poll_timeout_secs: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

/// Supported queue transports behind the provider abstraction.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// In-memory queue used for development and tests.
    Mock,
    /// Durable cloud queue reached over HTTP.
    Cloud,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let queue_backend = load_env_optional("QUEUE_PROVIDER")
            .map(|value| {
                value
                    .parse()
                    .map_err(|()| ConfigError::InvalidValue("QUEUE_PROVIDER".to_string()))
            })
            .transpose()?
            .unwrap_or(QueueBackend::Mock);

        let queue_service_url = load_env_optional("QUEUE_SERVICE_URL");
        if matches!(queue_backend, QueueBackend::Cloud) && queue_service_url.is_none() {
            return Err(ConfigError::MissingVariable("QUEUE_SERVICE_URL".to_string()));
        }

        Ok(Self {
            queue_backend,
            queue_service_url,
            queue_api_key: load_env_optional("QUEUE_API_KEY"),
            client_id: load_env_optional("CLIENT_ID")
                .map(|value| value.to_lowercase())
                .unwrap_or_else(|| "default".to_string()),
            notify_webhook_url: load_env_optional("NOTIFY_WEBHOOK_URL"),
            worker_polling_interval_secs: parse_env_or("WORKER_POLLING_INTERVAL", 5)?,
            worker_visibility_timeout_secs: parse_env_or("WORKER_VISIBILITY_TIMEOUT", 30)?,
            worker_task_timeout_secs: parse_env_or("WORKER_TASK_TIMEOUT", 1800)?,
            worker_max_messages: parse_env_or("WORKER_MAX_MESSAGES", 10)?,
            task_data: load_env_optional("TASK_DATA"),
            ingest_service_url: load_env_optional("INGEST_SERVICE_URL"),
            summarize_service_url: load_env_optional("SUMMARIZE_SERVICE_URL"),
            notify_retention: parse_env_or("NOTIFY_RETENTION", 1000)?,
            poll_timeout_secs: parse_env_or("POLL_TIMEOUT", 20)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Queue name derived from the client identifier.
    pub fn queue_name(&self) -> String {
        format!("{}-tasks", self.client_id)
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
        .map(|parsed| parsed.unwrap_or(default))
}

impl std::str::FromStr for QueueBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "cloud" => Ok(Self::Cloud),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        queue_backend = ?config.queue_backend,
        queue = %config.queue_name(),
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_backend_parses_known_values() {
        assert!(matches!("mock".parse(), Ok(QueueBackend::Mock)));
        assert!(matches!("Cloud".parse(), Ok(QueueBackend::Cloud)));
        assert!("celery".parse::<QueueBackend>().is_err());
    }

    #[test]
    fn queue_name_uses_client_id() {
        let config = Config {
            queue_backend: QueueBackend::Mock,
            queue_service_url: None,
            queue_api_key: None,
            client_id: "acme".into(),
            notify_webhook_url: None,
            worker_polling_interval_secs: 5,
            worker_visibility_timeout_secs: 30,
            worker_task_timeout_secs: 1800,
            worker_max_messages: 10,
            task_data: None,
            ingest_service_url: None,
            summarize_service_url: None,
            notify_retention: 1000,
            poll_timeout_secs: 20,
            server_port: None,
        };
        assert_eq!(config.queue_name(), "acme-tasks");
    }
}
