//! One live storage pipeline: a backend, its queue and its writer task

use std::sync::Arc;
use tokio::sync::Mutex;

use trafficlog_core::{
    ActivityEvent, BackendKind, DbStats, Result, Sanitizer, StorageBackend, StorageError,
};

use crate::config::{BackendConfig, PipelineConfig};
use crate::metrics::PipelineMetrics;
use crate::queue::{self, EventSender, QueueStats};
use crate::writer::{self, WriterConfig, WriterHandle};

pub struct ActivityStore {
    backend: Arc<dyn StorageBackend>,
    sender: EventSender,
    writer: Mutex<WriterHandle>,
    metrics: PipelineMetrics,
    pipeline: PipelineConfig,
}

impl ActivityStore {
    /// Start the queue and writer task for an already-connected backend
    pub fn start(backend: Arc<dyn StorageBackend>, pipeline: &PipelineConfig) -> Result<Self> {
        pipeline.validate()?;

        let metrics = PipelineMetrics::new(&backend.kind().to_string())
            .map_err(|e| StorageError::Config(format!("Failed to register metrics: {}", e)))?;
        let (sender, receiver) = queue::bounded(pipeline.queue_capacity, metrics.clone());
        let writer = writer::spawn(
            receiver,
            backend.clone(),
            metrics.clone(),
            WriterConfig {
                batch_size: pipeline.batch_size,
                batch_timeout: pipeline.batch_timeout(),
            },
        );

        tracing::info!(
            backend = %backend.describe(),
            queue_capacity = pipeline.queue_capacity,
            batch_size = pipeline.batch_size,
            "Activity store started"
        );

        Ok(Self {
            backend,
            sender,
            writer: Mutex::new(writer),
            metrics,
            pipeline: pipeline.clone(),
        })
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn sanitizer(&self) -> &'static dyn Sanitizer {
        self.backend.sanitizer()
    }

    /// Enqueue an already-sanitized event without waiting
    pub fn offer(&self, event: ActivityEvent) -> bool {
        self.sender.offer(event)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.sender.stats()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Queue and writer settings this store was started with
    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    /// Fresh statistics snapshot from the backend
    pub async fn stats(&self) -> Result<DbStats> {
        self.backend.query_stats().await
    }

    /// Point the live backend at new parameters of the same kind
    ///
    /// Switching to a different kind of backend needs a new store and a swap.
    pub async fn reconfigure(&self, config: &BackendConfig) -> Result<()> {
        if config.kind() != self.backend.kind() {
            return Err(StorageError::Config(format!(
                "Cannot reconfigure a {} backend as {}, swap the store instead",
                self.backend.kind(),
                config.kind()
            )));
        }

        let target = config.resolve()?;
        self.backend.reconfigure(target).await
    }

    /// Stop the writer after its final drain, then close the backend
    ///
    /// Returns false when the drain did not finish within the shutdown timeout.
    /// The backend is closed either way. Repeated calls are cheap no-ops.
    pub async fn shutdown(&self) -> bool {
        let drained = self
            .writer
            .lock()
            .await
            .shutdown(self.pipeline.shutdown_timeout())
            .await;
        self.backend.close().await;

        let queue = self.sender.stats();
        tracing::info!(
            backend = %self.backend.describe(),
            drained,
            enqueued = queue.enqueued,
            dropped = queue.dropped_full + queue.dropped_closed,
            "Activity store shut down"
        );
        drained
    }
}
