//! Binlens Error Types

use thiserror::Error;

/// Result type alias for Binlens operations
pub type Result<T> = std::result::Result<T, Error>;

/// Binlens error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("No table struct found for {table}, it may have been dropped. Rows event position: {position}")]
    SchemaNotFound { table: String, position: String },

    // Replication protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("No binary logs available on the server")]
    NoBinaryLogs,

    // Event errors
    #[error("Event decode error: {0}")]
    Decode(String),

    #[error("Checksum mismatch for event ending at position {log_pos}")]
    ChecksumMismatch { log_pos: u32 },

    #[error("SQL rendering failed: {0}")]
    Render(String),

    // Stream termination
    #[error("Timed out waiting for the next binlog event")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Pipeline errors
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is a normal end of a job rather than a failure
    pub fn is_expected_termination(&self) -> bool {
        matches!(self, Error::Timeout | Error::Cancelled)
    }

    /// Check if this error must abort the whole job
    pub fn is_fatal(&self) -> bool {
        !self.is_expected_termination()
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_termination() {
        assert!(Error::Timeout.is_expected_termination());
        assert!(Error::Cancelled.is_expected_termination());
        assert!(Error::NoBinaryLogs.is_fatal());

        let err = Error::SchemaNotFound {
            table: "`shop`.`orders`".to_string(),
            position: "(mysql-bin.000003, 1024)".to_string(),
        };
        assert!(err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("`shop`.`orders`"));
        assert!(msg.contains("mysql-bin.000003"));
    }
}
