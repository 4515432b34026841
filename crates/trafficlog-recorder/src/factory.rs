//! Backend and store factory
//!
//! Builds exactly one concrete backend from the configured variant, connects
//! it and wraps it in a running [`ActivityStore`].

use std::sync::Arc;

use trafficlog_core::{Result, StorageBackend, StorageError};

use crate::config::{BackendConfig, StorageConfig};
use crate::noop::NoopBackend;
use crate::store::ActivityStore;

/// Create and connect the backend described by `config`
///
/// # Errors
/// - `StorageError::Config` if the variant is not compiled in or its settings are unusable
/// - `StorageError::Connection` if the backend cannot be opened
pub async fn create_backend(config: &BackendConfig) -> Result<Arc<dyn StorageBackend>> {
    let target = config.resolve()?;

    match config {
        BackendConfig::Sqlite(_) => {
            #[cfg(feature = "sqlite")]
            {
                let trafficlog_core::ConnectionTarget::File(path) = target else {
                    return Err(StorageError::Config(
                        "SQLite backend needs a file path".to_string(),
                    ));
                };
                tracing::info!("Initializing SQLite storage at {:?}", path);
                let backend = crate::sqlite_backend::SqliteBackend::open(path).await?;
                Ok(Arc::new(backend))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                let _ = target;
                Err(StorageError::Config(
                    "SQLite storage is not enabled. Rebuild with the sqlite feature.".to_string(),
                ))
            }
        }
        BackendConfig::Postgres(settings) => {
            #[cfg(feature = "postgres")]
            {
                let trafficlog_core::ConnectionTarget::Server(server) = target else {
                    return Err(StorageError::Config(
                        "PostgreSQL backend needs a server target".to_string(),
                    ));
                };
                tracing::info!(server = %server, "Initializing PostgreSQL storage");
                let backend = trafficlog_postgres::PostgresBackend::open_with_config(
                    server,
                    postgres_client_config(settings),
                )
                .await?;
                Ok(Arc::new(backend))
            }

            #[cfg(not(feature = "postgres"))]
            {
                let _ = (target, settings);
                Err(StorageError::Config(
                    "PostgreSQL storage is not enabled. Rebuild with the postgres feature."
                        .to_string(),
                ))
            }
        }
    }
}

#[cfg(feature = "postgres")]
fn postgres_client_config(
    settings: &crate::config::PostgresSettings,
) -> trafficlog_postgres::PostgresBackendConfig {
    let mut config = trafficlog_postgres::PostgresBackendConfig::default();
    if let Some(secs) = settings.connect_timeout_secs.filter(|secs| *secs > 0) {
        config = config.with_connect_timeout(std::time::Duration::from_secs(secs));
    }
    if let Some(name) = settings
        .application_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        config = config.with_application_name(name);
    }
    config
}

/// Build the configured backend and start its pipeline
pub async fn create_storage(config: &StorageConfig) -> Result<ActivityStore> {
    config.pipeline.validate()?;
    let backend = create_backend(&config.backend).await?;
    ActivityStore::start(backend, &config.pipeline)
}

/// Like [`create_storage`], but degrade to a no-op store instead of failing
///
/// The second element carries the construction error when the fallback was
/// used; callers should treat logging as paused in that case. Only a failure
/// to start the no-op store itself is returned as an error.
pub async fn create_storage_or_fallback(
    config: &StorageConfig,
) -> Result<(ActivityStore, Option<StorageError>)> {
    match create_storage(config).await {
        Ok(store) => Ok((store, None)),
        Err(e) => {
            tracing::error!(
                error = %e,
                backend = %config.backend.kind(),
                "Failed to initialize activity storage, logging is paused"
            );
            let pipeline = if config.pipeline.validate().is_ok() {
                config.pipeline.clone()
            } else {
                Default::default()
            };
            let store = ActivityStore::start(Arc::new(NoopBackend), &pipeline)?;
            Ok((store, Some(e)))
        }
    }
}
