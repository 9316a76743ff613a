#![deny(missing_docs)]

//! Core library for the taskpipe dispatch and notification pipeline.

/// HTTP routing and REST handlers for the serving tier.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Structured logging and tracing setup.
pub mod logging;
/// Webhook dispatch and the in-memory notification queue.
pub mod notify;
/// Queue provider abstraction and transports.
pub mod queue;
/// Bounded exponential backoff primitives.
pub mod retry;
/// Worker loop, task handlers, and the dispatch harness.
pub mod worker;
