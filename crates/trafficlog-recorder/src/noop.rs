//! Degraded-mode backend used when the configured one cannot be built

use async_trait::async_trait;

use trafficlog_core::{
    ActivityEvent, BackendKind, ConnectionTarget, DbStats, InsertOutcome, PassThrough, Result,
    Sanitizer, StorageBackend,
};

/// Accepts every batch and stores nothing
#[derive(Debug, Default)]
pub struct NoopBackend;

#[async_trait]
impl StorageBackend for NoopBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Noop
    }

    fn describe(&self) -> String {
        "noop".to_string()
    }

    fn sanitizer(&self) -> &'static dyn Sanitizer {
        &PassThrough
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, events: &[ActivityEvent]) -> Result<InsertOutcome> {
        tracing::trace!(event_count = events.len(), "Discarding batch, storage unavailable");
        Ok(InsertOutcome {
            submitted: events.len(),
            accepted: 0,
        })
    }

    async fn query_stats(&self) -> Result<DbStats> {
        Ok(DbStats::default())
    }

    async fn reconfigure(&self, _target: ConnectionTarget) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}
