//! Bounded in-memory queue of delivery events for long-polling clients.
//!
//! Events carry monotonically increasing ids that clients use as poll cursors. The
//! queue retains at most `capacity` events and evicts the oldest on overflow, trading
//! delivery completeness for bounded memory. Readers never consume events; each client
//! tracks its own cursor, so a push is visible to every concurrent waiter.

use crate::queue::types::current_timestamp_rfc3339;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default retention cap carried over from the original deployment.
pub const DEFAULT_RETENTION: usize = 1000;

/// Fallback poll interval bounding CPU use when a push wake-up is missed.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A single delivery event retained for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Strictly increasing cursor value, never reused.
    pub id: u64,
    /// RFC3339 assignment time.
    pub timestamp: String,
    /// Arbitrary structured payload (task outcome).
    pub data: Value,
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<NotificationEvent>,
    last_id: u64,
}

/// In-memory notification queue shared between the webhook receiver and poll handlers.
///
/// Construct one instance during process startup and share it by reference; the
/// internal mutex guards only brief check/copy sections, never a full poll wait.
pub struct NotificationQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl NotificationQueue {
    /// Create a queue retaining at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, assign its id, and wake every waiting poller.
    pub fn push(&self, data: Value) -> u64 {
        let id = {
            let mut state = self.state.lock().expect("notification queue lock");
            state.last_id += 1;
            let id = state.last_id;
            state.events.push_back(NotificationEvent {
                id,
                timestamp: current_timestamp_rfc3339(),
                data,
            });
            while state.events.len() > self.capacity {
                state.events.pop_front();
            }
            id
        };
        self.notify.notify_waiters();
        tracing::debug!(id, "Notification queued");
        id
    }

    /// Return all retained events with `id > since_id`, waiting up to `timeout`.
    ///
    /// Returns an empty list (not an error) when nothing arrives in time. Waiters are
    /// woken promptly by a push and otherwise re-check at the fallback poll interval.
    pub async fn get_since(&self, since_id: u64, timeout: Duration) -> Vec<NotificationEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for wake-ups before checking, so a concurrent push between the
            // check and the await is not missed.
            let notified = self.notify.notified();

            let pending = self.collect_since(since_id);
            if !pending.is_empty() {
                return pending;
            }

            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let wait = POLL_INTERVAL.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("notification queue lock")
            .events
            .len()
    }

    /// Whether no events are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn collect_since(&self, since_id: u64) -> Vec<NotificationEvent> {
        let state = self.state.lock().expect("notification queue lock");
        state
            .events
            .iter()
            .filter(|event| event.id > since_id)
            .cloned()
            .collect()
    }
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn push_assigns_strictly_increasing_ids() {
        let queue = NotificationQueue::new(10);
        let ids: Vec<u64> = (0..5).map(|i| queue.push(json!({"seq": i}))).collect();
        for window in ids.windows(2) {
            assert!(window[1] > window[0]);
        }
    }

    #[tokio::test]
    async fn get_since_excludes_cursor_and_older() {
        let queue = NotificationQueue::new(10);
        for i in 0..5 {
            queue.push(json!({"seq": i}));
        }
        let events = queue.get_since(3, Duration::from_millis(10)).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| event.id > 3));
    }

    #[tokio::test]
    async fn retention_evicts_oldest_and_never_reuses_ids() {
        let queue = NotificationQueue::new(1000);
        for i in 0..1005 {
            queue.push(json!({"seq": i}));
        }
        assert_eq!(queue.len(), 1000);

        let events = queue.get_since(0, Duration::from_millis(10)).await;
        assert_eq!(events.len(), 1000);
        assert_eq!(events.first().map(|event| event.id), Some(6));
        assert_eq!(events.last().map(|event| event.id), Some(1005));

        // Evicted ids (1..=5) are gone for good.
        let early = queue.get_since(0, Duration::from_millis(10)).await;
        assert!(early.iter().all(|event| event.id > 5));
    }

    #[tokio::test]
    async fn empty_wait_returns_after_timeout() {
        let queue = NotificationQueue::new(10);
        let start = StdInstant::now();
        let events = queue.get_since(999_999, Duration::from_millis(500)).await;
        let elapsed = start.elapsed();
        assert!(events.is_empty());
        assert!(elapsed >= Duration::from_millis(400), "returned too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(700), "returned too late: {elapsed:?}");
    }

    #[tokio::test]
    async fn waiting_poller_wakes_on_push() {
        let queue = Arc::new(NotificationQueue::new(10));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get_since(0, Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        let start = StdInstant::now();
        queue.push(json!({"status": "completed"}));

        let events = waiter.await.expect("waiter");
        assert_eq!(events.len(), 1);
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "push should wake the waiter promptly"
        );
    }

    #[tokio::test]
    async fn push_wakes_every_concurrent_waiter() {
        let queue = Arc::new(NotificationQueue::new(10));

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.get_since(0, Duration::from_secs(2)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.push(json!({"status": "completed"}));

        for waiter in waiters {
            let events = waiter.await.expect("waiter");
            assert_eq!(events.len(), 1, "each waiter sees the pushed event");
        }
    }
}
