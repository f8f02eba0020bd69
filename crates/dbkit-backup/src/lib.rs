//! dbkit backup engine
//!
//! Streams databases to plain SQL dumps and loads them back, and groups
//! multi-database dumps into backups on disk.
//!
//! # Features
//!
//! ## Export
//! - **Paged reads**: tables are fetched a page at a time and written as multi-row `INSERT`s
//! - **Compression**: gzip and zstd in process, xz (and optionally the others) through the system binaries
//!
//! ## Import
//! - **Streaming tokenizer**: splits statements without loading the file, honouring quotes, comments and `DELIMITER`
//! - **Batched execution**: statements commit in transactions sized to the source
//! - **Resume**: uncompressed dumps can be restarted from a byte offset
//!
//! ## Backups
//! - **Parallel jobs**: one session per database, bounded by a worker pool
//! - **All or nothing**: a failed database removes the whole backup directory
//! - **Metadata**: `metadata.json` with per-file SHA-256 checksums, written last
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dbkit_backup::{BackupManager, BackupManagerConfig, BackupOptions, RestoreOptions};
//! use dbkit_core::driver::{ConnectionProvider, MysqlDialect};
//!
//! async fn nightly(provider: Arc<dyn ConnectionProvider>) -> dbkit_backup::Result<()> {
//!     let manager = BackupManager::new(
//!         BackupManagerConfig::new("/var/backups/dbkit"),
//!         provider,
//!         Arc::new(MysqlDialect),
//!     );
//!
//!     let backup = manager
//!         .create_backup(BackupOptions {
//!             databases: vec!["shop".to_string()],
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("Backup {} ({})", backup.id, backup.human_readable_size());
//!
//!     manager.restore_backup(RestoreOptions::new(&backup.id)).await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod bufio;
pub mod compression;
pub mod error;
pub mod export;
pub mod filters;
pub mod import;
pub mod metadata;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod tokenizer;
pub mod values;

// Re-export commonly used types
pub use batch::{BatchExecutor, BatchSummary, ErrorAction, ErrorPolicy};
pub use compression::{calculate_checksum, Compression, DumpFormat, DEFAULT_COMPRESSION_LEVEL};
pub use error::{BackupError, ExecutionError, Result};
pub use export::{export_sql, ExportOptions, ExportStats};
pub use import::{import_sql, ArchiveRestorer, ImportOptions, ImportStats, PgRestoreCommand};
pub use metadata::{BackupFile, BackupMetadata, METADATA_FILENAME};
pub use orchestrator::{
    BackupManager, BackupManagerConfig, BackupOptions, RestoreOptions, RestoredDatabase,
};
pub use pool::{resolve_parallelism, TaskOutcome, WorkerPool};
pub use progress::{progress_channel, ProgressEvent, ProgressRenderer, ProgressSender};
pub use tokenizer::{Statement, StatementReader};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
