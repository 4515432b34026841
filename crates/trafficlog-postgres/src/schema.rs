//! Idempotent schema setup for the activity table

use sqlx::PgConnection;
use tracing::debug;

use trafficlog_core::{Result, StorageError};

/// Statements run on every connect, in order
const SCHEMA: &[(&str, &str)] = &[
    (
        "create activity table",
        r#"
        CREATE TABLE IF NOT EXISTS activity (
            id BIGSERIAL PRIMARY KEY,
            source_ip TEXT NOT NULL,
            target_url TEXT NOT NULL,
            http_method TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            send_datetime TIMESTAMPTZ NOT NULL,
            request_raw TEXT NOT NULL,
            request_headers TEXT,
            request_body TEXT,
            request_size BIGINT NOT NULL DEFAULT 0,
            request_content_type TEXT,
            response_raw TEXT,
            response_headers TEXT,
            response_body TEXT,
            response_size BIGINT,
            http_status_code INTEGER,
            reason_phrase TEXT,
            response_mime_type TEXT,
            response_content_type TEXT,
            http_version TEXT,
            response_latency_ms BIGINT,
            request_raw_encoded BOOLEAN NOT NULL DEFAULT FALSE,
            request_body_encoded BOOLEAN NOT NULL DEFAULT FALSE,
            response_raw_encoded BOOLEAN NOT NULL DEFAULT FALSE,
            response_body_encoded BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "index send_datetime",
        "CREATE INDEX IF NOT EXISTS idx_activity_send_datetime ON activity(send_datetime)",
    ),
    (
        "index target_url",
        "CREATE INDEX IF NOT EXISTS idx_activity_target_url ON activity(target_url)",
    ),
];

/// Create the table and indexes if they do not exist yet
pub async fn initialize_schema(conn: &mut PgConnection) -> Result<()> {
    for (description, sql) in SCHEMA {
        debug!("Applying schema step: {}", description);
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Schema step '{}' failed: {}", description, e))
            })?;
    }
    Ok(())
}
