//! Storage backend abstraction
//!
//! Every persistence engine exposes the same capability set. The batch writer
//! only ever talks to a `dyn StorageBackend`, and callers select behavior from
//! the capability methods instead of inspecting the concrete type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::Result;
use crate::events::ActivityEvent;
use crate::sanitize::Sanitizer;
use crate::stats::DbStats;

/// Variant tag carried by every backend value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded single-file engine
    Sqlite,
    /// Networked client/server engine
    Postgres,
    /// Degraded mode, nothing is stored
    Noop,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Postgres => write!(f, "postgres"),
            BackendKind::Noop => write!(f, "noop"),
        }
    }
}

/// Fully resolved connection parameters for a networked engine
#[derive(Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Where a backend connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    File(PathBuf),
    Server(ServerTarget),
}

impl ConnectionTarget {
    pub fn kind(&self) -> BackendKind {
        match self {
            ConnectionTarget::File(_) => BackendKind::Sqlite,
            ConnectionTarget::Server(_) => BackendKind::Postgres,
        }
    }
}

/// Result of a batch insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOutcome {
    /// Events handed to the backend
    pub submitted: usize,
    /// Rows the engine reported as stored
    pub accepted: u64,
}

impl InsertOutcome {
    pub fn is_partial(&self) -> bool {
        self.accepted < self.submitted as u64
    }
}

/// Capability set shared by all persistence engines
///
/// Implementations own exactly one connection. Every public operation first
/// calls [`StorageBackend::ensure_connection`], so a dropped connection is
/// re-opened lazily on the next insert or query.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human readable location, used in log lines
    fn describe(&self) -> String;

    /// Whether the storage lives in a single local file that can be moved
    fn supports_file_relocation(&self) -> bool {
        false
    }

    /// Whether `DbStats::size_on_disk` is an approximation
    fn size_is_estimate(&self) -> bool {
        false
    }

    /// Text policy the producer applies before an event is enqueued
    fn sanitizer(&self) -> &'static dyn Sanitizer;

    /// Open the connection with auto-commit on and create the schema if absent
    async fn connect(&self) -> Result<()>;

    /// Re-open the connection if it is missing or no longer answers
    async fn ensure_connection(&self) -> Result<()>;

    /// Insert all events in one transaction; on error nothing is persisted
    async fn insert_batch(&self, events: &[ActivityEvent]) -> Result<InsertOutcome>;

    /// Compute the statistics snapshot
    async fn query_stats(&self) -> Result<DbStats>;

    /// Close and open again with the current parameters
    async fn reconnect(&self) -> Result<()> {
        self.close().await;
        self.connect().await
    }

    /// Close the current connection and connect to a new target of the same kind
    async fn reconfigure(&self, target: ConnectionTarget) -> Result<()>;

    /// Release the connection; calling it again is a no-op
    async fn close(&self);
}
