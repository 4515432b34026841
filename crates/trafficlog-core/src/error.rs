//! Error types for TrafficLog Core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not be opened or re-opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A batch failed mid-transaction and was rolled back.
    #[error("Write error: {0}")]
    Write(String),

    /// A statistics query failed.
    #[error("Query error: {0}")]
    Query(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True when the failure means the connection itself is unusable
    pub fn is_connection(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            StorageError::Connection("refused".to_string()).to_string(),
            "Connection error: refused"
        );
        assert_eq!(
            StorageError::Write("constraint".to_string()).to_string(),
            "Write error: constraint"
        );
        assert_eq!(
            StorageError::Query("syntax".to_string()).to_string(),
            "Query error: syntax"
        );
    }

    #[test]
    fn test_is_connection() {
        assert!(StorageError::Connection("x".to_string()).is_connection());
        assert!(!StorageError::Write("x".to_string()).is_connection());
    }
}
