//! TrafficLog Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout TrafficLog:
//! - The captured transaction event model
//! - The storage backend abstraction
//! - Database statistics and their rendering
//! - Core error types

pub mod backend;
pub mod error;
pub mod events;
pub mod sanitize;
pub mod stats;

pub use backend::{BackendKind, ConnectionTarget, InsertOutcome, ServerTarget, StorageBackend};
pub use error::{Result, StorageError};
pub use events::{ActivityEvent, CaptureSettings, RequestDescriptor, ResponseDescriptor};
pub use sanitize::{NulSafe, PassThrough, Sanitizer};
pub use stats::{DbStats, StatsQueries, StatsReport, collect_stats, format_bytes};
