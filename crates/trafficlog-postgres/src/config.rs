//! Connection options for the PostgreSQL backend

use std::time::Duration;

/// Client-side options applied to every connection the backend opens
///
/// # Example
/// ```
/// use trafficlog_postgres::PostgresBackendConfig;
/// use std::time::Duration;
///
/// let config = PostgresBackendConfig::default()
///     .with_connect_timeout(Duration::from_secs(3))
///     .with_application_name("capture-proxy");
/// ```
#[derive(Debug, Clone)]
pub struct PostgresBackendConfig {
    /// Upper bound for opening a connection, including the schema check
    pub connect_timeout: Duration,

    /// Reported to the server in `pg_stat_activity`
    pub application_name: String,
}

impl Default for PostgresBackendConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            application_name: "trafficlog".to_string(),
        }
    }
}

impl PostgresBackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PostgresBackendConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.application_name, "trafficlog");
    }

    #[test]
    fn test_builder_pattern() {
        let config = PostgresBackendConfig::new()
            .with_connect_timeout(Duration::from_millis(500))
            .with_application_name("scanner");
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
        assert_eq!(config.application_name, "scanner");
    }
}
