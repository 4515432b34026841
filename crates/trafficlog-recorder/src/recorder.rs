//! Producer-facing facade
//!
//! The capture layer hands every transaction to [`ActivityRecorder::record`].
//! The recorder owns the current [`ActivityStore`] and can replace it while
//! traffic keeps flowing.
//!
//! Swapping works under one `RwLock`. `record` holds the read side across its
//! suspended check and the enqueue. A swap flips `suspended` under the write
//! side, so once the flip returns no producer is still offering to the old
//! queue, and the old store can drain knowing nothing else arrives. Producers
//! never wait on the drain itself, only on the brief flips.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;

use trafficlog_core::{
    ActivityEvent, BackendKind, CaptureSettings, DbStats, RequestDescriptor, ResponseDescriptor,
    Result,
};

use crate::config::{BackendConfig, StorageConfig};
use crate::factory::{create_storage, create_storage_or_fallback};
use crate::metrics::PipelineMetrics;
use crate::noop::NoopBackend;
use crate::queue::QueueStats;
use crate::store::ActivityStore;

/// What happened to one `record` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Enqueued for the writer
    Queued,
    /// Capture is paused; nothing was built
    Paused,
    /// A backend swap is in progress; the transaction was skipped
    Suspended,
    /// The queue refused the event
    Dropped,
}

struct Current {
    store: Arc<ActivityStore>,
    suspended: bool,
}

pub struct ActivityRecorder {
    current: RwLock<Current>,
    logging_paused: AtomicBool,
    /// Serializes swaps against each other
    swap_lock: Mutex<()>,
}

impl ActivityRecorder {
    pub fn new(store: ActivityStore) -> Self {
        let logging_paused = store.kind() == BackendKind::Noop;
        Self {
            current: RwLock::new(Current {
                store: Arc::new(store),
                suspended: false,
            }),
            logging_paused: AtomicBool::new(logging_paused),
            swap_lock: Mutex::new(()),
        }
    }

    /// Build the configured store, falling back to a no-op store on failure
    ///
    /// A fallback leaves logging paused until a later successful
    /// [`ActivityRecorder::replace_from_config`].
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let (store, error) = create_storage_or_fallback(config).await?;
        let recorder = Self::new(store);
        if error.is_some() {
            recorder.logging_paused.store(true, Ordering::SeqCst);
        }
        Ok(recorder)
    }

    fn read(&self) -> RwLockReadGuard<'_, Current> {
        match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Current> {
        match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn store(&self) -> Arc<ActivityStore> {
        self.read().store.clone()
    }

    /// Capture one transaction; never blocks on storage
    ///
    /// `settings` is the caller's snapshot for this transaction. The response
    /// is ignored unless responses are included.
    pub fn record(
        &self,
        settings: &CaptureSettings,
        request: &RequestDescriptor,
        response: Option<&ResponseDescriptor>,
        tool: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> RecordOutcome {
        if settings.paused || self.is_logging_paused() {
            return RecordOutcome::Paused;
        }

        let response = response.filter(|_| settings.include_responses);
        let event = ActivityEvent::capture(request, response, tool, started_at);
        self.record_event(event)
    }

    /// Enqueue a prebuilt event through the current store
    pub fn record_event(&self, event: ActivityEvent) -> RecordOutcome {
        let current = self.read();
        if current.suspended {
            return RecordOutcome::Suspended;
        }

        let event = current.store.sanitizer().sanitize(event);
        if current.store.offer(event) {
            RecordOutcome::Queued
        } else {
            RecordOutcome::Dropped
        }
    }

    /// Replace the live store with `store`
    ///
    /// The old store is drained and closed before the new one takes traffic.
    pub async fn swap_backend(&self, store: ActivityStore) {
        let _swap = self.swap_lock.lock().await;
        let old = self.suspend();
        self.finish_swap(old, store).await;
    }

    /// Build a store from `config` and swap to it
    ///
    /// Acceptance is suspended while the new backend connects. If that fails
    /// the old store stays live and the error is returned.
    pub async fn replace_from_config(&self, config: &StorageConfig) -> Result<()> {
        let _swap = self.swap_lock.lock().await;
        let old = self.suspend();

        match create_storage(config).await {
            Ok(store) => {
                self.finish_swap(old, store).await;
                Ok(())
            }
            Err(e) => {
                self.write().suspended = false;
                tracing::error!(
                    error = %e,
                    backend = %config.backend.kind(),
                    "Failed to build new storage, keeping current backend"
                );
                Err(e)
            }
        }
    }

    /// Apply new parameters to the live backend if it is of the same kind
    ///
    /// A connection failure leaves the backend pointing at an unusable
    /// target, so the store is swapped for a no-op one and logging is paused
    /// until a later successful [`ActivityRecorder::replace_from_config`].
    /// The error is returned either way.
    pub async fn reconfigure(&self, config: &BackendConfig) -> Result<()> {
        let _swap = self.swap_lock.lock().await;
        let store = self.store();

        let err = match store.reconfigure(config).await {
            Err(e) if e.is_connection() => e,
            other => return other,
        };

        tracing::error!(
            error = %err,
            backend = %store.kind(),
            "Failed to reconfigure storage, logging is paused"
        );
        let fallback = ActivityStore::start(Arc::new(NoopBackend), store.pipeline())?;
        let old = self.suspend();
        self.finish_swap(old, fallback).await;
        Err(err)
    }

    fn suspend(&self) -> Arc<ActivityStore> {
        let mut current = self.write();
        current.suspended = true;
        current.store.clone()
    }

    async fn finish_swap(&self, old: Arc<ActivityStore>, new: ActivityStore) {
        let from = old.backend().describe();
        let to = new.backend().describe();
        let paused = new.kind() == BackendKind::Noop;

        old.shutdown().await;

        {
            let mut current = self.write();
            current.store = Arc::new(new);
            current.suspended = false;
        }
        self.logging_paused.store(paused, Ordering::SeqCst);

        tracing::info!(from = %from, to = %to, "Storage backend swapped");
    }

    /// Statistics of the current backend
    pub async fn stats(&self) -> Result<DbStats> {
        self.store().stats().await
    }

    /// Whether `DbStats::size_on_disk` from the current backend is an estimate
    pub fn size_is_estimate(&self) -> bool {
        self.store().backend().size_is_estimate()
    }

    pub fn kind(&self) -> BackendKind {
        self.store().kind()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.store().queue_stats()
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.store().metrics().clone()
    }

    /// True when storage could not be set up and capture is inert
    pub fn is_logging_paused(&self) -> bool {
        self.logging_paused.load(Ordering::SeqCst)
    }

    /// Stop accepting events, drain the current store and close it
    pub async fn shutdown(&self) -> bool {
        let _swap = self.swap_lock.lock().await;
        self.suspend().shutdown().await
    }
}
