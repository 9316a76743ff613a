//! Outcome delivery: worker-side webhook dispatch and the serving-tier
//! notification queue consumed by long-polling clients.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{NotificationDispatcher, NotifyError, TaskNotification};
pub use queue::{NotificationEvent, NotificationQueue};
