//! TrafficLog Recorder
//!
//! Asynchronous persistence pipeline for captured HTTP transactions:
//! - Bounded, non-blocking event queue with drop-on-full backpressure
//! - Batch writer task with bounded shutdown drain
//! - Embedded SQLite backend (and PostgreSQL with the `postgres` feature)
//! - Producer facade with runtime backend hot swap and no-op fallback

pub mod config;
pub mod factory;
pub mod metrics;
pub mod noop;
pub mod queue;
pub mod recorder;
pub mod store;
pub mod writer;

#[cfg(feature = "sqlite")]
pub mod sqlite_backend;

#[cfg(test)]
mod test_support;

pub use config::{
    BackendConfig, ConfigError, PipelineConfig, PostgresSettings, SqliteSettings, StorageConfig,
};
pub use factory::{create_backend, create_storage, create_storage_or_fallback};
pub use metrics::{DropReason, PipelineMetrics};
pub use noop::NoopBackend;
pub use queue::QueueStats;
pub use recorder::{ActivityRecorder, RecordOutcome};
pub use store::ActivityStore;

#[cfg(feature = "sqlite")]
pub use sqlite_backend::SqliteBackend;
