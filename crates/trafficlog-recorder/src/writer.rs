//! Batch writer loop
//!
//! One long-lived task per store moves events from the queue into the backend.
//! It runs in two phases: RUNNING collects and writes batches until the stop
//! signal is observed, then DRAINING closes the queue and writes whatever is
//! left before the task ends.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use trafficlog_core::{ActivityEvent, StorageBackend};

use crate::metrics::PipelineMetrics;
use crate::queue::EventReceiver;

/// Batch shaping for one writer
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

/// Start the writer task for `backend`, fed from `receiver`
pub fn spawn(
    receiver: EventReceiver,
    backend: Arc<dyn StorageBackend>,
    metrics: PipelineMetrics,
    config: WriterConfig,
) -> WriterHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let writer = BatchWriter {
        receiver,
        backend,
        metrics,
        config,
        stop: stop_rx,
    };
    let task = tokio::spawn(writer.run());

    WriterHandle {
        stop: stop_tx,
        task: Some(task),
    }
}

struct BatchWriter {
    receiver: EventReceiver,
    backend: Arc<dyn StorageBackend>,
    metrics: PipelineMetrics,
    config: WriterConfig,
    stop: watch::Receiver<bool>,
}

/// Events gathered in one cycle, plus whether the cycle ended on a stop request
struct Collected {
    events: Vec<ActivityEvent>,
    stopping: bool,
}

impl BatchWriter {
    async fn run(mut self) {
        tracing::debug!(backend = %self.backend.describe(), "Batch writer started");

        loop {
            let collected = self.collect_batch().await;
            if !collected.events.is_empty() {
                self.write_batch(&collected.events).await;
            }
            if collected.stopping {
                break;
            }
        }

        self.drain().await;
        tracing::debug!(backend = %self.backend.describe(), "Batch writer exited");
    }

    /// Gather up to `batch_size` events, for at most `batch_timeout`
    async fn collect_batch(&mut self) -> Collected {
        let mut events = Vec::with_capacity(self.config.batch_size);
        let deadline = Instant::now() + self.config.batch_timeout;

        if *self.stop.borrow() {
            return Collected {
                events,
                stopping: true,
            };
        }

        while events.len() < self.config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            tokio::select! {
                biased;
                // A dropped handle counts as a stop request
                _ = self.stop.changed() => {
                    return Collected { events, stopping: true };
                }
                event = self.receiver.poll(remaining) => match event {
                    Some(event) => events.push(event),
                    None if self.receiver.is_finished() => {
                        return Collected { events, stopping: true };
                    }
                    None => break,
                },
            }
        }

        Collected {
            events,
            stopping: false,
        }
    }

    /// Insert one batch; failures are logged, counted and never retried
    async fn write_batch(&self, events: &[ActivityEvent]) {
        let event_count = events.len();

        match self.backend.insert_batch(events).await {
            Ok(outcome) => {
                self.metrics.record_batch(outcome.submitted, outcome.accepted);
                tracing::debug!(
                    event_count,
                    accepted = outcome.accepted,
                    "Wrote activity batch"
                );
            }
            Err(e) => {
                self.metrics.batch_failures.inc();
                tracing::error!(
                    error = %e,
                    event_count,
                    backend = %self.backend.describe(),
                    "Failed to write activity batch, events dropped"
                );
                self.reconnect().await;
            }
        }
    }

    async fn reconnect(&self) {
        match self.backend.reconnect().await {
            Ok(()) => {
                self.metrics.record_reconnect(true);
                tracing::info!(backend = %self.backend.describe(), "Reconnected to storage");
            }
            Err(e) => {
                self.metrics.record_reconnect(false);
                tracing::warn!(
                    error = %e,
                    backend = %self.backend.describe(),
                    "Reconnect failed, will retry on next batch"
                );
            }
        }
    }

    /// Refuse new events and write everything still queued
    async fn drain(&mut self) {
        self.receiver.close();
        let remaining = self.receiver.drain();
        if remaining.is_empty() {
            return;
        }

        tracing::info!(
            event_count = remaining.len(),
            "Writing remaining events before shutdown"
        );
        for chunk in remaining.chunks(self.config.batch_size) {
            self.write_batch(chunk).await;
        }
    }
}

/// Owner side of a running writer task
pub struct WriterHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WriterHandle {
    /// Signal stop and wait for the final drain, at most `timeout`
    ///
    /// Returns false when the task had to be aborted; events still in flight
    /// at that point are lost. Calling it again is a no-op returning true.
    pub async fn shutdown(&mut self, timeout: Duration) -> bool {
        let Some(mut task) = self.task.take() else {
            return true;
        };

        // The task may already be gone, in which case nobody is listening
        let _ = self.stop.send(true);

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Batch writer task failed");
                false
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Batch writer did not finish draining in time, aborting"
                );
                false
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        // Dropping the stop sender wakes the writer, which then drains on its own
        if self.task.is_some() {
            tracing::warn!(
                "WriterHandle dropped without calling shutdown(). \
                 Writer will drain in the background but nothing waits for it."
            );
        }
    }
}
