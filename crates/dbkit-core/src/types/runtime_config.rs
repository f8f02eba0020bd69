//! Runtime configuration types for backup and restore jobs
//!
//! These types define configuration that controls where backups live and
//! how export/import jobs size their batches, buffers and parallelism.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Complete runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DbkitConfig {
    /// Backup and restore policies
    #[serde(default)]
    pub backup: BackupConfig,

    /// Connection behaviour
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupConfig {
    /// Root directory holding one sub-directory per backup.
    /// When unset, `<data home>/dbkit/backups` is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backups_dir: Option<Utf8PathBuf>,

    /// Compression for new backups ("", "gzip", "xz" or "zstd")
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Degree of parallelism: 0 = sequential, negative = one job per CPU
    #[serde(default)]
    pub parallelism: i32,

    /// Rows per multi-row INSERT in exported dumps
    #[serde(default = "default_export_batch_rows")]
    pub export_batch_rows: usize,

    /// Rows fetched per page while exporting a table
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// Largest statement the import tokenizer will buffer, in bytes
    #[serde(default = "default_max_statement_size")]
    pub max_statement_size: usize,

    /// Pipe through external gzip/xz/zstd binaries instead of in-process codecs
    #[serde(default)]
    pub external_codecs: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backups_dir: None,
            compression: default_compression(),
            parallelism: 0,
            export_batch_rows: default_export_batch_rows(),
            fetch_size: default_fetch_size(),
            max_statement_size: default_max_statement_size(),
            external_codecs: false,
        }
    }
}

fn default_compression() -> String {
    "gzip".to_string()
}
fn default_export_batch_rows() -> usize {
    1000
}
fn default_fetch_size() -> usize {
    10_000
}
fn default_max_statement_size() -> usize {
    64 * 1024 * 1024 // 64 MiB
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    /// Deadline for the liveness check run before each job
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: default_liveness_timeout(),
        }
    }
}

fn default_liveness_timeout() -> u64 {
    5
}
