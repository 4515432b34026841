//! Bounded event queue between the capture path and the batch writer
//!
//! Producers never wait: `offer` either hands the event over or drops it.
//! The single writer side waits only inside `poll`, bounded by a timeout.

use std::time::Duration;
use tokio::sync::mpsc;

use trafficlog_core::ActivityEvent;

use crate::metrics::{DropReason, PipelineMetrics};

/// Create a queue holding at most `capacity` events
pub fn bounded(capacity: usize, metrics: PipelineMetrics) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx, metrics }, EventReceiver { rx })
}

/// Producer side, cheap to clone
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<ActivityEvent>,
    metrics: PipelineMetrics,
}

impl EventSender {
    /// Enqueue without blocking
    ///
    /// Returns false when the queue is full or the writer has stopped; the
    /// event is dropped in both cases.
    pub fn offer(&self, event: ActivityEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.metrics.events_enqueued.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_dropped(DropReason::Full);
                tracing::warn!(
                    capacity = self.tx.max_capacity(),
                    "Event queue full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.metrics.record_dropped(DropReason::Closed);
                tracing::error!("Event queue closed, dropping event");
                false
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let capacity = self.tx.max_capacity();
        QueueStats {
            capacity,
            pending: capacity - self.tx.capacity(),
            enqueued: self.metrics.events_enqueued.get(),
            dropped_full: self.metrics.dropped(DropReason::Full),
            dropped_closed: self.metrics.dropped(DropReason::Closed),
        }
    }
}

/// Writer side, owned by exactly one batch writer
pub struct EventReceiver {
    rx: mpsc::Receiver<ActivityEvent>,
}

impl EventReceiver {
    /// Wait at most `timeout` for the next event
    pub async fn poll(&mut self, timeout: Duration) -> Option<ActivityEvent> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Refuse further offers; events already queued stay receivable
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// True once no producer can offer again and nothing is left to receive
    pub fn is_finished(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }

    /// Take every event currently queued
    pub fn drain(&mut self) -> Vec<ActivityEvent> {
        let mut events = Vec::with_capacity(self.rx.len());
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub pending: usize,
    pub enqueued: u64,
    pub dropped_full: u64,
    pub dropped_closed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::event;

    fn queue(capacity: usize) -> (EventSender, EventReceiver) {
        bounded(capacity, PipelineMetrics::new("test").unwrap())
    }

    #[tokio::test]
    async fn test_offer_then_poll_is_fifo() {
        let (tx, mut rx) = queue(10);
        assert!(tx.offer(event("A")));
        assert!(tx.offer(event("B")));

        let timeout = Duration::from_millis(50);
        assert_eq!(rx.poll(timeout).await.unwrap().target_url, "A");
        assert_eq!(rx.poll(timeout).await.unwrap().target_url, "B");
        assert!(rx.poll(timeout).await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_retaining() {
        let (tx, mut rx) = queue(1);
        assert!(tx.offer(event("A")));
        assert!(!tx.offer(event("B")));

        let stats = tx.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.dropped_full, 1);

        let drained = rx.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].target_url, "A");
    }

    #[tokio::test]
    async fn test_closed_queue_refuses_but_keeps_pending() {
        let (tx, mut rx) = queue(4);
        assert!(tx.offer(event("A")));
        rx.close();

        assert!(!tx.offer(event("B")));
        assert_eq!(tx.stats().dropped_closed, 1);

        let drained = rx.drain();
        assert_eq!(drained.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let (_tx, mut rx) = queue(4);
        let started = tokio::time::Instant::now();
        assert!(rx.poll(Duration::from_millis(1000)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(1000));
    }
}
