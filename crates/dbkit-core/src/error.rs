//! Error types for dbkit-core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using dbkit-core's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for dbkit
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format or value
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlParse(#[from] serde_yaml_ng::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A statement or query was rejected by the server
    #[error("Database error: {message}")]
    Database { message: String },

    /// The session could not be established or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The liveness check did not complete in time
    #[error("Connection did not respond within {timeout:?}")]
    Timeout { timeout: Duration },

    /// A query returned a shape the caller did not expect
    #[error("Unexpected result for {query}: {message}")]
    UnexpectedResult { query: String, message: String },

    /// Could not resolve a standard directory
    #[error("Could not determine {kind} directory")]
    MissingDirectory { kind: String },
}

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::ConfigNotFound { path: path.into() }
    }

    /// Create an invalid config error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an unexpected result error
    pub fn unexpected_result(query: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnexpectedResult {
            query: query.into(),
            message: message.into(),
        }
    }

    /// Create a missing directory error
    pub fn missing_directory(kind: impl Into<String>) -> Self {
        Self::MissingDirectory { kind: kind.into() }
    }
}
