//! Error types for backup and restore jobs.

use std::fmt;
use std::io;

use dbkit_core::truncate_for_display;
use thiserror::Error;

/// Result type alias using the backup error type
pub type Result<T> = std::result::Result<T, BackupError>;

/// Longest statement excerpt carried by an error
pub const STATEMENT_EXCERPT_CHARS: usize = 200;

/// Errors produced by export, import and backup orchestration.
#[derive(Error, Debug)]
pub enum BackupError {
    /// A file could not be opened, created, read or written
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// An external compressor, decompressor or restore tool could not start
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// An external process ran but reported failure
    #[error("{program} exited with {status}{}", stderr_suffix(.stderr))]
    ProcessFailed {
        program: String,
        status: String,
        stderr: String,
    },

    /// The tokenizer buffered more than the configured limit without a delimiter
    #[error("Statement exceeds {limit} bytes without a delimiter (at byte {offset})")]
    StatementTooLarge { limit: usize, offset: u64 },

    /// Statement bytes were not valid UTF-8
    #[error("Invalid UTF-8 in statement ending at byte {offset}")]
    InvalidEncoding { offset: u64 },

    /// A statement failed inside a batch
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// One database of a multi-database backup failed; nothing was kept
    #[error("Backup of database '{database}' failed: {source}")]
    PartialBackup {
        database: String,
        #[source]
        source: Box<BackupError>,
    },

    /// Restoring one database failed
    #[error("Restore of database '{database}' failed: {source}")]
    Restore {
        database: String,
        #[source]
        source: Box<BackupError>,
    },

    /// A dump file no longer matches the checksum recorded at backup time
    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A worker task panicked
    #[error("Job panicked: {0}")]
    Panicked(String),

    /// No complete backup with this id exists
    #[error("Backup not found: {0}")]
    NotFound(String),

    /// Resume offsets only work on uncompressed input
    #[error("Cannot resume {path}: resume is only supported for uncompressed dumps")]
    ResumeUnsupported { path: String },

    /// Caller supplied options that cannot be honoured
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Session or dialect failure outside a batch
    #[error(transparent)]
    Database(#[from] dbkit_core::Error),

    /// metadata.json could not be encoded or decoded
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", truncate_for_display(trimmed, STATEMENT_EXCERPT_CHARS))
    }
}

fn unwrap_carried(source: io::Error) -> std::result::Result<BackupError, io::Error> {
    if !source
        .get_ref()
        .is_some_and(|inner| inner.is::<BackupError>())
    {
        return Err(source);
    }
    let kind = source.kind();
    match source.into_inner().map(|inner| inner.downcast::<BackupError>()) {
        Some(Ok(carried)) => Ok(*carried),
        Some(Err(inner)) => Err(io::Error::new(kind, inner)),
        None => Err(io::Error::from(kind)),
    }
}

impl BackupError {
    /// Attach a path to an I/O error.
    ///
    /// A `BackupError` carried inside the I/O error (a failed codec process
    /// surfacing through `Read`/`Write`) is returned as itself.
    pub fn io(path: impl fmt::Display, source: io::Error) -> Self {
        match unwrap_carried(source) {
            Ok(carried) => carried,
            Err(source) => Self::Io {
                path: path.to_string(),
                source,
            },
        }
    }

    /// Wrap an error as the failure of one database's restore
    pub fn restore(database: impl Into<String>, source: BackupError) -> Self {
        Self::Restore {
            database: database.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error as the failure of one database's backup
    pub fn partial_backup(database: impl Into<String>, source: BackupError) -> Self {
        Self::PartialBackup {
            database: database.into(),
            source: Box::new(source),
        }
    }
}

/// A statement that failed while its batch was executing.
///
/// The whole batch has been rolled back by the time this error exists.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Statement at byte {offset} failed: {message} [{statement}]")]
pub struct ExecutionError {
    /// Database the statement ran against
    pub database: String,
    /// Byte offset in the source just past the failing statement
    pub offset: u64,
    /// Statement text, truncated for reporting
    pub statement: String,
    /// Driver message
    pub message: String,
}

impl ExecutionError {
    pub fn new(
        database: impl Into<String>,
        offset: u64,
        statement: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            offset,
            statement: truncate_for_display(statement, STATEMENT_EXCERPT_CHARS),
            message: message.into(),
        }
    }
}
