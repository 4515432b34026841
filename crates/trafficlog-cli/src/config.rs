use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use trafficlog_recorder::{BackendConfig, PostgresSettings, SqliteSettings, StorageConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Keep sqlx statement logging at the configured level instead of WARN
    #[serde(default)]
    pub log_sql_queries: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_sql_queries: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        let config = if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)?
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)?
        };

        Ok(config)
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        // Backend selection first, so the per-backend variables below apply to it
        if let Ok(val) = std::env::var("TRAFFICLOG_BACKEND") {
            match val.to_lowercase().as_str() {
                "sqlite" => {
                    if !matches!(self.storage.backend, BackendConfig::Sqlite(_)) {
                        self.storage.backend = BackendConfig::Sqlite(SqliteSettings::default());
                    }
                }
                "postgres" | "postgresql" => {
                    if !matches!(self.storage.backend, BackendConfig::Postgres(_)) {
                        self.storage.backend = BackendConfig::Postgres(PostgresSettings::default());
                    }
                }
                _ => eprintln!("Warning: Invalid TRAFFICLOG_BACKEND '{}', ignoring", val),
            }
        }

        match &mut self.storage.backend {
            BackendConfig::Sqlite(sqlite) => {
                if let Ok(val) = std::env::var("TRAFFICLOG_SQLITE_PATH") {
                    sqlite.path = PathBuf::from(val);
                }
            }
            BackendConfig::Postgres(postgres) => {
                let vars = [
                    ("TRAFFICLOG_PG_HOST", &mut postgres.host),
                    ("TRAFFICLOG_PG_PORT", &mut postgres.port),
                    ("TRAFFICLOG_PG_DATABASE", &mut postgres.database),
                    ("TRAFFICLOG_PG_USER", &mut postgres.username),
                    ("TRAFFICLOG_PG_PASSWORD", &mut postgres.password),
                ];
                for (name, field) in vars {
                    if let Ok(val) = std::env::var(name) {
                        *field = Some(val);
                    }
                }
            }
        }

        if let Ok(val) = std::env::var("TRAFFICLOG_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Read `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.merge_env();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use trafficlog_core::BackendKind;

    const ENV_VARS: &[&str] = &[
        "TRAFFICLOG_BACKEND",
        "TRAFFICLOG_SQLITE_PATH",
        "TRAFFICLOG_PG_HOST",
        "TRAFFICLOG_PG_PORT",
        "TRAFFICLOG_PG_DATABASE",
        "TRAFFICLOG_PG_USER",
        "TRAFFICLOG_PG_PASSWORD",
        "TRAFFICLOG_LOG_LEVEL",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            unsafe {
                std::env::remove_var(name);
            }
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_file() {
        clear_env();
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.storage.backend.kind(), BackendKind::Sqlite);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.log_sql_queries);
    }

    #[test]
    #[serial]
    fn test_yaml_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
storage:
  backend:
    kind: sqlite
    path: /data/activity.db
  pipeline:
    batch_size: 25
  capture:
    include_responses: true
logging:
  level: debug
  log_sql_queries: true
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(
            config.storage.backend,
            BackendConfig::Sqlite(SqliteSettings {
                path: PathBuf::from("/data/activity.db")
            })
        );
        assert_eq!(config.storage.pipeline.batch_size, 25);
        assert!(config.storage.capture.include_responses);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.log_sql_queries);
    }

    #[test]
    #[serial]
    fn test_toml_file() {
        clear_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[storage.backend]
kind = "postgres"
host = "db"
port = 6543

[logging]
level = "warn"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        match &config.storage.backend {
            BackendConfig::Postgres(settings) => {
                assert_eq!(settings.host.as_deref(), Some("db"));
                assert_eq!(settings.resolve().port, 6543);
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    #[serial]
    fn test_env_switches_backend_and_fills_settings() {
        clear_env();
        unsafe {
            std::env::set_var("TRAFFICLOG_BACKEND", "postgres");
            std::env::set_var("TRAFFICLOG_PG_HOST", "pg.internal");
            std::env::set_var("TRAFFICLOG_PG_PORT", "not-a-port");
            std::env::set_var("TRAFFICLOG_PG_PASSWORD", "s3cret");
            std::env::set_var("TRAFFICLOG_LOG_LEVEL", "trace");
        }

        let config = AppConfig::load(None).unwrap();
        clear_env();

        let target = match &config.storage.backend {
            BackendConfig::Postgres(settings) => settings.resolve(),
            other => panic!("unexpected backend {:?}", other),
        };
        assert_eq!(target.host, "pg.internal");
        assert_eq!(target.port, 5432);
        assert_eq!(target.password, "s3cret");
        assert_eq!(config.logging.level, "trace");
    }

    #[test]
    #[serial]
    fn test_env_sqlite_path() {
        clear_env();
        unsafe {
            std::env::set_var("TRAFFICLOG_SQLITE_PATH", "/tmp/override.db");
            std::env::set_var("TRAFFICLOG_BACKEND", "bogus");
        }

        let config = AppConfig::load(None).unwrap();
        clear_env();

        assert_eq!(
            config.storage.backend,
            BackendConfig::Sqlite(SqliteSettings {
                path: PathBuf::from("/tmp/override.db")
            })
        );
    }
}
