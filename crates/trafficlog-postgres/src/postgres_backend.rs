//! PostgresBackend - StorageBackend implementation over a single PostgreSQL connection

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, Postgres};
use sqlx::{ConnectOptions, Connection, QueryBuilder};
use std::sync::RwLock;
use tokio::sync::Mutex;

use trafficlog_core::{
    ActivityEvent, BackendKind, ConnectionTarget, DbStats, InsertOutcome, NulSafe, Result,
    Sanitizer, ServerTarget, StatsQueries, StorageBackend, StorageError, collect_stats,
};

use crate::config::PostgresBackendConfig;
use crate::schema::initialize_schema;

/// Stored size is not measurable per table; each record counts as one kilobyte
const ESTIMATED_BYTES_PER_RECORD: u64 = 1024;

/// PostgreSQL allows 65535 bind parameters per statement; 24 columns per row
const MAX_ROWS_PER_STATEMENT: usize = 1000;

const INSERT_ACTIVITY: &str = "INSERT INTO activity (\
    source_ip, target_url, http_method, tool_name, send_datetime, \
    request_raw, request_headers, request_body, request_size, request_content_type, \
    response_raw, response_headers, response_body, response_size, \
    http_status_code, reason_phrase, response_mime_type, response_content_type, \
    http_version, response_latency_ms, \
    request_raw_encoded, request_body_encoded, response_raw_encoded, response_body_encoded) ";

/// Networked storage backend
///
/// Holds exactly one connection. Inserts and statistics queries lock it for
/// their whole duration, so a stats request never lands inside a batch
/// transaction.
pub struct PostgresBackend {
    target: RwLock<ServerTarget>,
    config: PostgresBackendConfig,
    conn: Mutex<Option<PgConnection>>,
}

impl PostgresBackend {
    /// Backend for `target`, not yet connected
    pub fn new(target: ServerTarget) -> Self {
        Self::with_config(target, PostgresBackendConfig::default())
    }

    pub fn with_config(target: ServerTarget, config: PostgresBackendConfig) -> Self {
        Self {
            target: RwLock::new(target),
            config,
            conn: Mutex::new(None),
        }
    }

    /// Create the backend and connect it right away
    ///
    /// # Errors
    /// - `StorageError::Connection` if the server is unreachable, rejects the
    ///   credentials or the schema cannot be created
    pub async fn open(target: ServerTarget) -> Result<Self> {
        Self::open_with_config(target, PostgresBackendConfig::default()).await
    }

    /// [`PostgresBackend::open`] with explicit client options
    pub async fn open_with_config(
        target: ServerTarget,
        config: PostgresBackendConfig,
    ) -> Result<Self> {
        let backend = Self::with_config(target, config);
        backend.connect().await?;
        Ok(backend)
    }

    pub fn target(&self) -> ServerTarget {
        match self.target.read() {
            Ok(target) => target.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_target(&self, target: ServerTarget) {
        match self.target.write() {
            Ok(mut current) => *current = target,
            Err(poisoned) => *poisoned.into_inner() = target,
        }
    }

    fn connect_options(&self, target: &ServerTarget) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database)
            .username(&target.username)
            .application_name(&self.config.application_name);

        if target.password.is_empty() {
            options
        } else {
            options.password(&target.password)
        }
    }

    async fn open_connection(&self) -> Result<PgConnection> {
        let target = self.target();
        let options = self.connect_options(&target);

        let opening = async {
            let mut conn = options.connect().await.map_err(|e| {
                StorageError::Connection(format!("Failed to connect to PostgreSQL at {}: {}", target, e))
            })?;
            initialize_schema(&mut conn).await?;
            Ok::<_, StorageError>(conn)
        };

        tokio::time::timeout(self.config.connect_timeout, opening)
            .await
            .map_err(|_| {
                StorageError::Connection(format!(
                    "Timed out connecting to PostgreSQL at {} after {:?}",
                    target, self.config.connect_timeout
                ))
            })?
    }

    /// Make sure `slot` holds a live connection and return it
    async fn ensure_open<'a>(
        &self,
        slot: &'a mut Option<PgConnection>,
    ) -> Result<&'a mut PgConnection> {
        let alive = match slot.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };

        if !alive {
            if let Some(stale) = slot.take() {
                tracing::warn!(target_db = %self.target(), "PostgreSQL connection lost, reconnecting");
                let _ = stale.close().await;
            }
            *slot = Some(self.open_connection().await?);
        }

        slot.as_mut().ok_or_else(|| {
            StorageError::Connection("PostgreSQL connection unavailable".to_string())
        })
    }
}

fn push_rows<'a>(builder: &mut QueryBuilder<'a, Postgres>, events: &'a [ActivityEvent]) {
    builder.push_values(events, |mut row, event| {
        row.push_bind(event.source_ip.as_str())
            .push_bind(event.target_url.as_str())
            .push_bind(event.http_method.as_str())
            .push_bind(event.tool_name.as_str())
            .push_bind(event.send_datetime)
            .push_bind(event.request_raw.as_str())
            .push_bind(event.request_headers.as_str())
            .push_bind(event.request_body.as_str())
            .push_bind(to_i64(event.request_size))
            .push_bind(event.request_content_type.as_deref())
            .push_bind(event.response_raw.as_deref())
            .push_bind(event.response_headers.as_deref())
            .push_bind(event.response_body.as_deref())
            .push_bind(event.response_size.map(to_i64))
            .push_bind(event.status_code.map(i32::from))
            .push_bind(event.reason_phrase.as_deref())
            .push_bind(event.response_mime_type.as_deref())
            .push_bind(event.response_content_type.as_deref())
            .push_bind(event.http_version.as_str())
            .push_bind(event.response_latency_ms)
            .push_bind(event.request_raw_encoded)
            .push_bind(event.request_body_encoded)
            .push_bind(event.response_raw_encoded)
            .push_bind(event.response_body_encoded);
    });
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

struct PgStatsQueries<'a> {
    conn: &'a mut PgConnection,
}

impl PgStatsQueries<'_> {
    async fn scalar(&mut self, sql: &str) -> Result<u64> {
        let value: Option<i64> = sqlx::query_scalar(sql)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0))
    }
}

#[async_trait]
impl StatsQueries for PgStatsQueries<'_> {
    async fn record_count(&mut self) -> Result<u64> {
        self.scalar("SELECT COUNT(*) FROM activity").await
    }

    async fn total_request_size(&mut self) -> Result<u64> {
        // SUM over BIGINT yields NUMERIC
        self.scalar("SELECT COALESCE(SUM(request_size), 0)::BIGINT FROM activity")
            .await
    }

    async fn biggest_request_size(&mut self) -> Result<u64> {
        self.scalar("SELECT COALESCE(MAX(request_size), 0) FROM activity")
            .await
    }

    async fn max_hits_by_second(&mut self) -> Result<u64> {
        self.scalar(
            "SELECT COUNT(*) AS hits FROM activity \
             GROUP BY date_trunc('second', send_datetime) \
             ORDER BY hits DESC LIMIT 1",
        )
        .await
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn describe(&self) -> String {
        format!("postgres://{}", self.target())
    }

    fn size_is_estimate(&self) -> bool {
        true
    }

    fn sanitizer(&self) -> &'static dyn Sanitizer {
        &NulSafe
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if let Some(old) = slot.take() {
            let _ = old.close().await;
        }
        *slot = Some(self.open_connection().await?);

        tracing::info!(target_db = %self.target(), "Connected to PostgreSQL storage");
        Ok(())
    }

    async fn ensure_connection(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        self.ensure_open(&mut slot).await.map(|_| ())
    }

    async fn insert_batch(&self, events: &[ActivityEvent]) -> Result<InsertOutcome> {
        if events.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let mut slot = self.conn.lock().await;
        let conn = self.ensure_open(&mut slot).await?;

        let mut tx = conn
            .begin()
            .await
            .map_err(|e| StorageError::Write(format!("Failed to begin transaction: {}", e)))?;

        let mut accepted = 0;
        for chunk in events.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::new(INSERT_ACTIVITY);
            push_rows(&mut builder, chunk);
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Write(format!("Failed to insert batch: {}", e)))?;
            accepted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Write(format!("Failed to commit batch: {}", e)))?;

        let outcome = InsertOutcome {
            submitted: events.len(),
            accepted,
        };
        if outcome.is_partial() {
            tracing::warn!(
                submitted = outcome.submitted,
                accepted = outcome.accepted,
                "PostgreSQL stored fewer rows than submitted"
            );
        }
        Ok(outcome)
    }

    async fn query_stats(&self) -> Result<DbStats> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_open(&mut slot).await?;

        let mut stats = collect_stats(&mut PgStatsQueries { conn }).await?;
        stats.size_on_disk = stats.total_record_count * ESTIMATED_BYTES_PER_RECORD;
        Ok(stats)
    }

    async fn reconfigure(&self, target: ConnectionTarget) -> Result<()> {
        let server = match target {
            ConnectionTarget::Server(server) => server,
            other => {
                return Err(StorageError::Config(format!(
                    "PostgreSQL backend cannot use a {} target",
                    other.kind()
                )));
            }
        };

        let mut slot = self.conn.lock().await;
        if let Some(old) = slot.take() {
            let _ = old.close().await;
        }
        self.set_target(server);
        *slot = Some(self.open_connection().await?);

        tracing::info!(target_db = %self.target(), "PostgreSQL storage reconfigured");
        Ok(())
    }

    async fn close(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error while closing PostgreSQL connection");
            }
            tracing::info!(target_db = %self.target(), "PostgreSQL storage closed");
        }
    }
}
