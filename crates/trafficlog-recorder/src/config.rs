//! Storage and pipeline configuration

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use trafficlog_core::{
    BackendKind, CaptureSettings, ConnectionTarget, ServerTarget, StorageError,
};

pub const DEFAULT_POSTGRES_HOST: &str = "localhost";
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;
pub const DEFAULT_POSTGRES_DATABASE: &str = "traffic_log";
pub const DEFAULT_POSTGRES_USERNAME: &str = "postgres";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Could not determine home directory")]
    NoHomeDirectory,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for StorageError {
    fn from(e: ConfigError) -> Self {
        StorageError::Config(e.to_string())
    }
}

/// Everything needed to build one storage pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Initial capture settings handed to the producer facade
    #[serde(default)]
    pub capture: CaptureSettings,
}

/// Backend discriminator plus backend-specific parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Sqlite(SqliteSettings),
    Postgres(PostgresSettings),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Sqlite(SqliteSettings::default())
    }
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Sqlite(_) => BackendKind::Sqlite,
            BackendConfig::Postgres(_) => BackendKind::Postgres,
        }
    }

    /// Turn user-facing settings into concrete connection parameters
    pub fn resolve(&self) -> Result<ConnectionTarget, ConfigError> {
        match self {
            BackendConfig::Sqlite(sqlite) => Ok(ConnectionTarget::File(sqlite.resolved_path()?)),
            BackendConfig::Postgres(postgres) => Ok(ConnectionTarget::Server(postgres.resolve())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteSettings {
    /// Path to the database file, `~` is expanded
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

impl SqliteSettings {
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        expand_tilde(&self.path)
    }
}

/// Networked engine settings, as typed by the operator
///
/// Every field is optional; missing or blank values fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostgresSettings {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default, deserialize_with = "port_from_any")]
    pub port: Option<String>,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Upper bound for opening a connection; the backend default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Reported to the server as the client application name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
}

impl PostgresSettings {
    /// Apply defaults; an unparsable port is logged and replaced by the default
    pub fn resolve(&self) -> ServerTarget {
        let port = match self.port.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            None => DEFAULT_POSTGRES_PORT,
            Some(raw) => parse_port(raw).unwrap_or_else(|e| {
                tracing::warn!(
                    error = %e,
                    default = DEFAULT_POSTGRES_PORT,
                    "Invalid PostgreSQL port, using default"
                );
                DEFAULT_POSTGRES_PORT
            }),
        };

        ServerTarget {
            host: non_blank(&self.host).unwrap_or(DEFAULT_POSTGRES_HOST).to_string(),
            port,
            database: non_blank(&self.database)
                .unwrap_or(DEFAULT_POSTGRES_DATABASE)
                .to_string(),
            username: non_blank(&self.username)
                .unwrap_or(DEFAULT_POSTGRES_USERNAME)
                .to_string(),
            password: self.password.clone().unwrap_or_default(),
        }
    }
}

/// Queue and batch writer tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Events held in memory before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum events per insert
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time spent collecting one batch (milliseconds)
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Maximum wait for the writer to finish its final drain (milliseconds)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "batch_timeout_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

pub fn expand_tilde(path: &std::path::Path) -> Result<PathBuf, ConfigError> {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or(ConfigError::NoHomeDirectory),
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Ports are often written as numbers in YAML and as text in env vars
fn port_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(i64),
        Text(String),
    }

    Ok(Option::<RawPort>::deserialize(deserializer)?.map(|raw| match raw {
        RawPort::Number(n) => n.to_string(),
        RawPort::Text(s) => s,
    }))
}

// Default value functions for serde
fn default_sqlite_path() -> PathBuf {
    PathBuf::from("~/trafficlog.db")
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StorageConfig::default();
        assert_eq!(config.backend.kind(), BackendKind::Sqlite);
        assert_eq!(config.pipeline.queue_capacity, 10_000);
        assert_eq!(config.pipeline.batch_size, 100);
        assert_eq!(config.pipeline.batch_timeout(), Duration::from_millis(1000));
        assert_eq!(config.pipeline.shutdown_timeout(), Duration::from_secs(5));
        assert!(!config.capture.paused);
        assert!(config.pipeline.validate().is_ok());
    }

    #[test]
    fn test_postgres_defaults() {
        let target = PostgresSettings::default().resolve();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 5432);
        assert_eq!(target.database, "traffic_log");
        assert_eq!(target.username, "postgres");
        assert_eq!(target.password, "");
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let settings = PostgresSettings {
            host: Some("  ".to_string()),
            port: Some(" ".to_string()),
            database: Some(String::new()),
            username: None,
            password: None,
            ..Default::default()
        };
        let target = settings.resolve();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 5432);
        assert_eq!(target.database, "traffic_log");
    }

    #[test]
    fn test_invalid_port_falls_back() {
        let settings = PostgresSettings {
            port: Some("54x2".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.resolve().port, DEFAULT_POSTGRES_PORT);

        let settings = PostgresSettings {
            port: Some(" 6543 ".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.resolve().port, 6543);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("5433"), Ok(5433));
        assert_eq!(
            parse_port("0"),
            Err(ConfigError::InvalidPort("0".to_string()))
        );
        assert!(parse_port("70000").is_err());
        assert!(parse_port("abc").is_err());
    }

    #[test]
    fn test_pipeline_validation() {
        let config = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let plain = PathBuf::from("/tmp/x.db");
        assert_eq!(expand_tilde(&plain).unwrap(), plain);

        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde(&PathBuf::from("~/x.db")).unwrap(),
                home.join("x.db")
            );
        }
    }

    #[test]
    fn test_yaml_backend_selection() {
        let yaml = r#"
backend:
  kind: postgres
  host: db.internal
  port: 6432
  database: capture
pipeline:
  batch_size: 50
"#;
        let config: StorageConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.backend.kind(), BackendKind::Postgres);
        assert_eq!(config.pipeline.batch_size, 50);
        assert_eq!(config.pipeline.queue_capacity, 10_000);

        match config.backend.resolve().unwrap() {
            ConnectionTarget::Server(target) => {
                assert_eq!(target.host, "db.internal");
                assert_eq!(target.port, 6432);
                assert_eq!(target.database, "capture");
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_yaml_postgres_client_options() {
        let yaml = r#"
backend:
  kind: postgres
  connect_timeout_secs: 3
  application_name: capture-proxy
"#;
        let config: StorageConfig = serde_yaml::from_str(yaml).unwrap();
        match config.backend {
            BackendConfig::Postgres(settings) => {
                assert_eq!(settings.connect_timeout_secs, Some(3));
                assert_eq!(settings.application_name.as_deref(), Some("capture-proxy"));
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_toml_sqlite_backend() {
        let text = r#"
[backend]
kind = "sqlite"
path = "/var/lib/trafficlog/activity.db"
"#;
        let config: StorageConfig = toml::from_str(text).unwrap();
        assert_eq!(
            config.backend.resolve().unwrap(),
            ConnectionTarget::File(PathBuf::from("/var/lib/trafficlog/activity.db"))
        );
    }

    #[test]
    fn test_port_as_text() {
        let json = r#"{"kind":"postgres","port":"5544"}"#;
        let backend: BackendConfig = serde_json::from_str(json).unwrap();
        match backend {
            BackendConfig::Postgres(settings) => {
                assert_eq!(settings.port.as_deref(), Some("5544"))
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }
}
