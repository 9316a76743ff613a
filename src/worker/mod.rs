//! Task execution: handler contract, shipped handlers, and the consumer loop.

pub mod consumer;
pub mod handler;
pub mod handlers;

pub use consumer::{Consumer, ConsumerSettings};
pub use handler::{HandlerError, HandlerRegistry, TaskHandler, TaskKind, TaskOutcome};
pub use handlers::{BackendServiceHandler, registry_from_config};
