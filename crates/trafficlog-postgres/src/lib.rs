//! PostgreSQL storage backend for TrafficLog
//!
//! Implements the `StorageBackend` trait over a single PostgreSQL connection.
//! The schema is created on connect if it does not exist.
//!
//! # Example
//! ```no_run
//! # use trafficlog_postgres::PostgresBackend;
//! # use trafficlog_core::{ServerTarget, StorageBackend};
//! # async fn example() -> trafficlog_core::Result<()> {
//! let backend = PostgresBackend::open(ServerTarget {
//!     host: "localhost".to_string(),
//!     port: 5432,
//!     database: "traffic_log".to_string(),
//!     username: "postgres".to_string(),
//!     password: String::new(),
//! })
//! .await?;
//! let stats = backend.query_stats().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod postgres_backend;
mod schema;

pub use config::PostgresBackendConfig;
pub use postgres_backend::PostgresBackend;
