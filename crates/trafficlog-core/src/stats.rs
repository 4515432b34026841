//! Aggregate statistics over the persisted corpus

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

const ONE_KB: f64 = 1024.0;
const ONE_MB: f64 = 1024.0 * 1024.0;
const ONE_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Snapshot of the four summary metrics plus storage size
///
/// Computed fresh for every request, never cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbStats {
    /// File size for file-based engines, an estimate for networked ones
    pub size_on_disk: u64,
    pub total_record_count: u64,
    /// Sum of request sizes across all records
    pub total_requests_size: u64,
    pub biggest_request_size: u64,
    /// Highest number of records whose send time falls in the same second
    pub max_hits_by_second: u64,
}

impl DbStats {
    pub fn is_empty(&self) -> bool {
        self.total_record_count == 0
    }
}

/// The four read queries every backend answers for its statistics
#[async_trait]
pub trait StatsQueries: Send {
    async fn record_count(&mut self) -> Result<u64>;

    async fn total_request_size(&mut self) -> Result<u64>;

    async fn biggest_request_size(&mut self) -> Result<u64>;

    /// Row count of the fullest one-second bucket of send timestamps
    async fn max_hits_by_second(&mut self) -> Result<u64>;
}

/// Run the statistics queries, skipping all but the count on an empty store
///
/// `size_on_disk` is left at zero; it is backend-specific and filled in by the caller.
pub async fn collect_stats<Q>(queries: &mut Q) -> Result<DbStats>
where
    Q: StatsQueries + ?Sized,
{
    let total_record_count = queries.record_count().await?;
    if total_record_count == 0 {
        return Ok(DbStats::default());
    }

    Ok(DbStats {
        size_on_disk: 0,
        total_record_count,
        total_requests_size: queries.total_request_size().await?,
        biggest_request_size: queries.biggest_request_size().await?,
        max_hits_by_second: queries.max_hits_by_second().await?,
    })
}

/// Render a byte count using 1024-based units with two decimals
///
/// The largest unit whose threshold the value reaches is used; anything
/// below one megabyte is expressed in kilobytes.
pub fn format_bytes(bytes: u64) -> String {
    let value = bytes as f64;
    let (unit, label) = if value >= ONE_GB {
        (ONE_GB, "GB")
    } else if value >= ONE_MB {
        (ONE_MB, "MB")
    } else {
        (ONE_KB, "KB")
    };
    format!("{:.2} {}", value / unit, label)
}

/// Operator-facing rendering of a [`DbStats`] snapshot
pub struct StatsReport<'a> {
    stats: &'a DbStats,
    /// Whether `size_on_disk` is measured or estimated
    size_is_estimate: bool,
}

impl<'a> StatsReport<'a> {
    pub fn new(stats: &'a DbStats, size_is_estimate: bool) -> Self {
        Self {
            stats,
            size_is_estimate,
        }
    }
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size_label = if self.size_is_estimate {
            "Estimated size of the database"
        } else {
            "Size of the database file on the disk"
        };
        writeln!(f, "{}: {}", size_label, format_bytes(self.stats.size_on_disk))?;
        writeln!(
            f,
            "Amount of data sent by the biggest HTTP request: {}",
            format_bytes(self.stats.biggest_request_size)
        )?;
        writeln!(
            f,
            "Total amount of data sent via HTTP requests: {}",
            format_bytes(self.stats.total_requests_size)
        )?;
        writeln!(
            f,
            "Total number of records in the database: {} HTTP requests",
            self.stats.total_record_count
        )?;
        write!(
            f,
            "Maximum number of hits sent in a second: {} Hits",
            self.stats.max_hits_by_second
        )
    }
}
