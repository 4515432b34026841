//! Embedded SQLite storage backend

use async_trait::async_trait;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, QueryBuilder};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::Mutex;

use trafficlog_core::{
    ActivityEvent, BackendKind, ConnectionTarget, DbStats, InsertOutcome, PassThrough, Result,
    Sanitizer, StatsQueries, StorageBackend, StorageError, collect_stats,
};

/// SQLite accepts 32766 bound parameters per statement; 24 columns per row
const MAX_ROWS_PER_STATEMENT: usize = 1000;

const INSERT_ACTIVITY: &str = "INSERT INTO activity (\
    source_ip, target_url, http_method, tool_name, send_datetime, \
    request_raw, request_headers, request_body, request_size, request_content_type, \
    response_raw, response_headers, response_body, response_size, \
    http_status_code, reason_phrase, response_mime_type, response_content_type, \
    http_version, response_latency_ms, \
    request_raw_encoded, request_body_encoded, response_raw_encoded, response_body_encoded) ";

pub struct SqliteBackend {
    path: RwLock<PathBuf>,
    conn: Mutex<Option<SqliteConnection>>,
}

impl SqliteBackend {
    /// Backend for `path`, not yet connected
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: RwLock::new(path.into()),
            conn: Mutex::new(None),
        }
    }

    /// Create the backend and connect it right away
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let backend = Self::new(path);
        backend.connect().await?;
        Ok(backend)
    }

    pub fn path(&self) -> PathBuf {
        match self.path.read() {
            Ok(path) => path.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_path(&self, path: PathBuf) {
        match self.path.write() {
            Ok(mut current) => *current = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    async fn open_connection(db_path: &Path) -> Result<SqliteConnection> {
        // Create directory if needed
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut conn = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .connect()
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to open {}: {}", db_path.display(), e))
            })?;

        Self::initialize_schema(&mut conn).await?;
        Ok(conn)
    }

    async fn initialize_schema(conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_ip TEXT NOT NULL,
                target_url TEXT NOT NULL,
                http_method TEXT NOT NULL,
                tool_name TEXT NOT NULL,
                send_datetime TIMESTAMP NOT NULL,
                request_raw TEXT NOT NULL,
                request_headers TEXT,
                request_body TEXT,
                request_size INTEGER NOT NULL DEFAULT 0,
                request_content_type TEXT,
                response_raw TEXT,
                response_headers TEXT,
                response_body TEXT,
                response_size INTEGER,
                http_status_code INTEGER,
                reason_phrase TEXT,
                response_mime_type TEXT,
                response_content_type TEXT,
                http_version TEXT,
                response_latency_ms INTEGER,
                request_raw_encoded BOOLEAN NOT NULL DEFAULT 0,
                request_body_encoded BOOLEAN NOT NULL DEFAULT 0,
                response_raw_encoded BOOLEAN NOT NULL DEFAULT 0,
                response_body_encoded BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Connection(format!("Failed to create schema: {}", e)))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_activity_send_datetime ON activity(send_datetime)",
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Connection(format!("Failed to create index: {}", e)))?;

        Ok(())
    }

    /// Make sure `slot` holds a live connection and return it
    async fn ensure_open<'a>(
        &self,
        slot: &'a mut Option<SqliteConnection>,
    ) -> Result<&'a mut SqliteConnection> {
        let alive = match slot.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        };

        if !alive {
            if let Some(stale) = slot.take() {
                tracing::warn!(path = %self.path().display(), "SQLite connection lost, reopening");
                let _ = stale.close().await;
            }
            *slot = Some(Self::open_connection(&self.path()).await?);
        }

        slot.as_mut()
            .ok_or_else(|| StorageError::Connection("SQLite connection unavailable".to_string()))
    }

    async fn file_size(&self) -> Result<u64> {
        match tokio::fs::metadata(self.path()).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append one VALUES row per event to `builder`
fn push_rows<'a>(builder: &mut QueryBuilder<'a, Sqlite>, events: &'a [ActivityEvent]) {
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
            .push_bind(event.status_code.map(i64::from))
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

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

struct SqliteStatsQueries<'a> {
    conn: &'a mut SqliteConnection,
}

impl SqliteStatsQueries<'_> {
    async fn scalar(&mut self, sql: &str) -> Result<u64> {
        let value: Option<i64> = sqlx::query_scalar(sql)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;
        Ok(value.map(to_u64).unwrap_or(0))
    }
}

#[async_trait]
impl StatsQueries for SqliteStatsQueries<'_> {
    async fn record_count(&mut self) -> Result<u64> {
        self.scalar("SELECT COUNT(*) FROM activity").await
    }

    async fn total_request_size(&mut self) -> Result<u64> {
        self.scalar("SELECT COALESCE(SUM(request_size), 0) FROM activity")
            .await
    }

    async fn biggest_request_size(&mut self) -> Result<u64> {
        self.scalar("SELECT COALESCE(MAX(request_size), 0) FROM activity")
            .await
    }

    async fn max_hits_by_second(&mut self) -> Result<u64> {
        self.scalar(
            "SELECT COUNT(*) AS hits FROM activity \
             GROUP BY strftime('%Y-%m-%d %H:%M:%S', send_datetime) \
             ORDER BY hits DESC LIMIT 1",
        )
        .await
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path().display())
    }

    fn supports_file_relocation(&self) -> bool {
        true
    }

    fn sanitizer(&self) -> &'static dyn Sanitizer {
        &PassThrough
    }

    async fn connect(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if let Some(old) = slot.take() {
            let _ = old.close().await;
        }
        *slot = Some(Self::open_connection(&self.path()).await?);

        tracing::info!(path = %self.path().display(), "Connected to SQLite storage");
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
            .map_err(|e| StorageError::Write(e.to_string()))?;

        let mut accepted = 0;
        for chunk in events.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::new(INSERT_ACTIVITY);
            push_rows(&mut builder, chunk);
            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| StorageError::Write(e.to_string()))?;
            accepted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Write(e.to_string()))?;

        let outcome = InsertOutcome {
            submitted: events.len(),
            accepted,
        };
        if outcome.is_partial() {
            tracing::warn!(
                submitted = outcome.submitted,
                accepted = outcome.accepted,
                "SQLite stored fewer rows than submitted"
            );
        }
        Ok(outcome)
    }

    async fn query_stats(&self) -> Result<DbStats> {
        let mut slot = self.conn.lock().await;
        let conn = self.ensure_open(&mut slot).await?;

        let mut stats = collect_stats(&mut SqliteStatsQueries { conn }).await?;
        stats.size_on_disk = self.file_size().await?;
        Ok(stats)
    }

    async fn reconfigure(&self, target: ConnectionTarget) -> Result<()> {
        let path = match target {
            ConnectionTarget::File(path) => path,
            other => {
                return Err(StorageError::Config(format!(
                    "SQLite backend cannot use a {} target",
                    other.kind()
                )));
            }
        };

        let mut slot = self.conn.lock().await;
        if let Some(old) = slot.take() {
            let _ = old.close().await;
        }
        self.set_path(path);
        *slot = Some(Self::open_connection(&self.path()).await?);

        tracing::info!(path = %self.path().display(), "SQLite storage relocated");
        Ok(())
    }

    async fn close(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error while closing SQLite connection");
            }
            tracing::info!(path = %self.path().display(), "SQLite storage closed");
        }
    }
}
