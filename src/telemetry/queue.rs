//! Bounded event queue between request handlers and the batch flusher
//!
//! Producers never wait: a full (or closed) queue rejects the event and the
//! drop is counted. The receiving half is a single, non-cloneable
//! [`EventReceiver`] owned by exactly one flusher.

use crate::error::QueueError;
use crate::telemetry::event::TelemetryEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dropped_full: AtomicU64,
    dropped_closed: AtomicU64,
}

/// Producer handle, cheap to clone and share across handlers
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: mpsc::Sender<TelemetryEvent>,
    counters: Arc<QueueCounters>,
}

/// Consumer half of the queue
#[derive(Debug)]
pub struct EventReceiver {
    receiver: mpsc::Receiver<TelemetryEvent>,
}

/// Result of waiting for the next event
#[derive(Debug)]
pub enum Received {
    Event(TelemetryEvent),
    Timeout,
    Closed,
}

/// Create a queue holding at most `capacity` pending events
///
/// A zero capacity is clamped to one.
pub fn event_queue(capacity: usize) -> (EventQueue, EventReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        EventQueue {
            sender,
            counters: Arc::new(QueueCounters::default()),
        },
        EventReceiver { receiver },
    )
}

impl EventQueue {
    /// Enqueue an event without waiting
    ///
    /// Returns `false` when the queue is full or closed; the event is dropped
    /// and the queue is left unchanged.
    pub fn enqueue(&self, event: TelemetryEvent) -> bool {
        match self.try_enqueue(event) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    reason = err.reason(),
                    queue_capacity = self.capacity(),
                    "Telemetry event dropped"
                );
                false
            }
        }
    }

    pub fn try_enqueue(&self, event: TelemetryEvent) -> Result<(), QueueError> {
        let err = match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_event_enqueued();
                crate::metrics::set_queue_depth(self.len());
                return Ok(());
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                QueueError::Full
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped_closed.fetch_add(1, Ordering::Relaxed);
                QueueError::Closed
            }
        };

        crate::metrics::record_event_dropped(err.reason());
        Err(err)
    }

    /// Number of events currently waiting in the queue
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Total events accepted since creation
    pub fn enqueued_count(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }

    /// Total events rejected since creation (full or closed)
    pub fn dropped_count(&self) -> u64 {
        self.counters.dropped_full.load(Ordering::Relaxed)
            + self.counters.dropped_closed.load(Ordering::Relaxed)
    }

    pub fn dropped_full_count(&self) -> u64 {
        self.counters.dropped_full.load(Ordering::Relaxed)
    }
}

impl EventReceiver {
    /// Wait up to `timeout` for the next event
    ///
    /// Cancel safe: dropping the future never loses an event.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Received {
        match tokio::time::timeout(timeout, self.receiver.recv()).await {
            Ok(Some(event)) => {
                crate::metrics::set_queue_depth(self.len());
                Received::Event(event)
            }
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }

    /// Pop the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<TelemetryEvent> {
        match self.receiver.try_recv() {
            Ok(event) => {
                crate::metrics::set_queue_depth(self.len());
                Some(event)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Number of events still buffered
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Stop accepting new events; already buffered events stay readable
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::event::{Component, RequestStatus, UserRole};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn event(request_id: &str) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: Utc::now(),
            user_id: "user".to_string(),
            user_role: UserRole::Employee,
            model: "mixtral-8x7b".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            latency_ms: 50,
            ttft_ms: None,
            tokens_per_second: None,
            cost_usd: Decimal::ZERO,
            status: RequestStatus::Success,
            error_type: None,
            error_message: None,
            component: Component::ApiRouter,
            cache_hit: false,
            trace_id: None,
            span_id: None,
            request_id: request_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_receive_in_order() {
        let (queue, mut receiver) = event_queue(8);

        assert!(queue.enqueue(event("a")));
        assert!(queue.enqueue(event("b")));
        assert_eq!(queue.len(), 2);

        let first = receiver.try_recv().unwrap();
        let second = receiver.try_recv().unwrap();
        assert_eq!(first.request_id, "a");
        assert_eq!(second.request_id, "b");
        assert!(receiver.try_recv().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_changing_state() {
        let (queue, mut receiver) = event_queue(2);

        assert!(queue.enqueue(event("a")));
        assert!(queue.enqueue(event("b")));
        assert!(!queue.enqueue(event("c")));
        assert_eq!(queue.try_enqueue(event("d")), Err(QueueError::Full));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.enqueued_count(), 2);
        assert_eq!(queue.dropped_count(), 2);
        assert_eq!(queue.dropped_full_count(), 2);

        assert_eq!(receiver.try_recv().unwrap().request_id, "a");
        assert_eq!(receiver.try_recv().unwrap().request_id, "b");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_but_keeps_buffered_events() {
        let (queue, mut receiver) = event_queue(4);
        assert!(queue.enqueue(event("a")));

        receiver.close();
        assert!(queue.is_closed());
        assert_eq!(queue.try_enqueue(event("b")), Err(QueueError::Closed));

        assert_eq!(receiver.try_recv().unwrap().request_id, "a");
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_timeout() {
        let (queue, mut receiver) = event_queue(4);

        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(1)).await,
            Received::Timeout
        ));

        queue.enqueue(event("a"));
        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(1)).await,
            Received::Event(e) if e.request_id == "a"
        ));

        drop(queue);
        assert!(matches!(
            receiver.recv_timeout(Duration::from_secs(1)).await,
            Received::Closed
        ));
    }

    #[test]
    fn test_queue_depth_gauge_follows_both_ends() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let (queue, mut receiver) = event_queue(8);

        let depth = || {
            handle
                .render()
                .lines()
                .find(|line| line.starts_with("telemetry_queue_depth "))
                .and_then(|line| line.trim_start_matches("telemetry_queue_depth ").parse::<f64>().ok())
        };

        ::metrics::with_local_recorder(&recorder, || {
            queue.enqueue(event("a"));
            queue.enqueue(event("b"));
            queue.enqueue(event("c"));
        });
        assert_eq!(depth(), Some(3.0));
        assert_eq!(receiver.len(), 3);

        ::metrics::with_local_recorder(&recorder, || {
            let _ = receiver.try_recv();
        });
        assert_eq!(depth(), Some(2.0));

        ::metrics::with_local_recorder(&recorder, || {
            while receiver.try_recv().is_some() {}
        });
        assert_eq!(depth(), Some(0.0));
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (queue, _receiver) = event_queue(0);
        assert_eq!(queue.capacity(), 1);
    }
}
