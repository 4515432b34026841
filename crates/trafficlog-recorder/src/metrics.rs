//! Prometheus counters for one storage pipeline
//!
//! Each [`crate::ActivityStore`] owns a registry, so swapping backends starts
//! a fresh set of counters and the old ones stay readable until dropped.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Why an offered event did not enter the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Queue at capacity
    Full,
    /// Writer already stopped
    Closed,
}

impl DropReason {
    fn as_label(&self) -> &'static str {
        match self {
            DropReason::Full => "full",
            DropReason::Closed => "closed",
        }
    }
}

#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Arc<Registry>,

    /// Events accepted by the queue
    pub events_enqueued: IntCounter,
    /// Events refused by the queue, by reason
    pub events_dropped: IntCounterVec,
    /// Batches committed
    pub batches_written: IntCounter,
    /// Batches rolled back and lost
    pub batch_failures: IntCounter,
    /// Rows the engine reported as stored
    pub rows_inserted: IntCounter,
    /// Rows submitted in committed batches but not reported as stored
    pub rows_rejected: IntCounter,
    /// Reconnect attempts after a failed batch, by outcome
    pub reconnects: IntCounterVec,
}

impl PipelineMetrics {
    pub fn new(backend: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("backend", backend)
        };

        let events_enqueued = IntCounter::with_opts(opts(
            "trafficlog_events_enqueued_total",
            "Total number of events accepted by the queue",
        ))?;

        let events_dropped = IntCounterVec::new(
            opts(
                "trafficlog_events_dropped_total",
                "Total number of events refused by the queue",
            ),
            &["reason"],
        )?;

        let batches_written = IntCounter::with_opts(opts(
            "trafficlog_batches_written_total",
            "Total number of batches committed",
        ))?;

        let batch_failures = IntCounter::with_opts(opts(
            "trafficlog_batch_failures_total",
            "Total number of batches rolled back",
        ))?;

        let rows_inserted = IntCounter::with_opts(opts(
            "trafficlog_rows_inserted_total",
            "Total number of rows stored",
        ))?;

        let rows_rejected = IntCounter::with_opts(opts(
            "trafficlog_rows_rejected_total",
            "Total number of rows submitted but not stored",
        ))?;

        let reconnects = IntCounterVec::new(
            opts(
                "trafficlog_reconnects_total",
                "Reconnect attempts after a failed batch",
            ),
            &["outcome"],
        )?;

        registry.register(Box::new(events_enqueued.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(batches_written.clone()))?;
        registry.register(Box::new(batch_failures.clone()))?;
        registry.register(Box::new(rows_inserted.clone()))?;
        registry.register(Box::new(rows_rejected.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            events_enqueued,
            events_dropped,
            batches_written,
            batch_failures,
            rows_inserted,
            rows_rejected,
            reconnects,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.events_dropped
            .with_label_values(&[reason.as_label()])
            .inc();
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.events_dropped
            .with_label_values(&[reason.as_label()])
            .get()
    }

    pub fn record_batch(&self, submitted: usize, accepted: u64) {
        self.batches_written.inc();
        self.rows_inserted.inc_by(accepted);
        self.rows_rejected
            .inc_by((submitted as u64).saturating_sub(accepted));
    }

    pub fn record_reconnect(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.reconnects.with_label_values(&[outcome]).inc();
    }

    /// Prometheus text exposition of every counter
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
