//! SQL dump loader.
//!
//! Plain SQL dumps are decompressed, split into statements by the tokenizer
//! and executed in transactional batches. Opaque archives (PostgreSQL
//! custom format) are handed to an [`ArchiveRestorer`] instead.
//!
//! Foreign-key and unique checks are switched off for the duration of a
//! plain SQL import and put back to their previous values afterwards, also
//! when the import fails.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use dbkit_core::driver::{Connection, Dialect};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::batch::{batch_size_for, BatchExecutor, ErrorPolicy};
use crate::bufio::buffer_size_for;
use crate::compression::{codec_for, detect_format, Compression, DumpFormat};
use crate::error::{BackupError, ExecutionError, Result};
use crate::progress::{emit, ProgressEvent, ProgressSender};
use crate::tokenizer::{StatementReader, DEFAULT_DELIMITER, DEFAULT_MAX_STATEMENT_SIZE};
use crate::values::encode_value;

/// Statements between two progress events
const PROGRESS_INTERVAL: u64 = 100;

/// Configuration for one database import.
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Dump file to load
    pub path: Utf8PathBuf,
    /// Database the statements run against
    pub database: String,
    /// Run `CREATE DATABASE IF NOT EXISTS` first
    pub create_database: bool,
    /// Name the dump was taken from, when loading it under a different name.
    /// `CREATE DATABASE`/`USE` statements naming it are skipped.
    pub rename_from: Option<String>,
    /// Codec to use instead of detecting one
    pub compression: Option<Compression>,
    pub external_codec: bool,
    pub max_statement_size: usize,
    /// Statements per transaction; chosen from the file size when unset
    pub batch_size: Option<usize>,
    /// Byte offset of a statement boundary to start from (uncompressed only)
    pub resume_offset: u64,
    /// Delimiter in effect at `resume_offset`, as reported by
    /// [`ImportStats::delimiter`] of the interrupted run; `;` when unset
    pub resume_delimiter: Option<String>,
    pub error_policy: ErrorPolicy,
    pub progress: Option<ProgressSender>,
    /// Tool for archive formats; `pg_restore` when unset
    pub archive_restorer: Option<Arc<dyn ArchiveRestorer>>,
}

impl ImportOptions {
    pub fn new(path: impl Into<Utf8PathBuf>, database: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            database: database.into(),
            create_database: false,
            rename_from: None,
            compression: None,
            external_codec: false,
            max_statement_size: DEFAULT_MAX_STATEMENT_SIZE,
            batch_size: None,
            resume_offset: 0,
            resume_delimiter: None,
            error_policy: ErrorPolicy::default(),
            progress: None,
            archive_restorer: None,
        }
    }
}

/// Outcome of one import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportStats {
    pub statements_executed: u64,
    /// Statements dropped by the rename filter
    pub statements_skipped: u64,
    /// Bytes of SQL consumed, counted from the start of the file
    pub bytes_read: u64,
    /// File size for uncompressed sources, `None` for compressed ones
    pub total_bytes: Option<u64>,
    /// Offset just past the last statement read
    pub end_offset: u64,
    /// Delimiter in effect at `end_offset`
    pub delimiter: String,
    /// Failures the error policy chose to continue past
    pub errors: Vec<ExecutionError>,
    pub duration: Duration,
    pub compression: Compression,
    pub format: DumpFormat,
}

impl ImportStats {
    fn empty(compression: Compression, format: DumpFormat) -> Self {
        Self {
            statements_executed: 0,
            statements_skipped: 0,
            bytes_read: 0,
            total_bytes: None,
            end_offset: 0,
            delimiter: DEFAULT_DELIMITER.to_string(),
            errors: Vec::new(),
            duration: Duration::ZERO,
            compression,
            format,
        }
    }
}

/// Restores dump formats that are not SQL text.
#[async_trait]
pub trait ArchiveRestorer: Send + Sync + std::fmt::Debug {
    async fn restore(&self, path: &Utf8Path, database: &str) -> Result<()>;
}

/// Runs `pg_restore --dbname <database> <path>`.
///
/// Connection parameters come from the usual `PG*` environment variables or
/// from `extra_args`.
#[derive(Debug, Clone)]
pub struct PgRestoreCommand {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl PgRestoreCommand {
    /// Locates `pg_restore` on `PATH`.
    pub fn new() -> Result<Self> {
        let program = which::which("pg_restore").map_err(|e| BackupError::Spawn {
            program: "pg_restore".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
        })?;
        Ok(Self::with_program(program))
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: vec!["--no-owner".to_string()],
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

#[async_trait]
impl ArchiveRestorer for PgRestoreCommand {
    async fn restore(&self, path: &Utf8Path, database: &str) -> Result<()> {
        let program = self.program.display().to_string();
        info!("Restoring archive {} with {}", path, program);

        let output = tokio::process::Command::new(&self.program)
            .arg("--dbname")
            .arg(database)
            .args(&self.extra_args)
            .arg(path.as_std_path())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(BackupError::ProcessFailed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Loads a dump file into `options.database`.
pub async fn import_sql(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    options: &ImportOptions,
) -> Result<ImportStats> {
    let started = Instant::now();
    let detected = detect_format(options.path.as_std_path(), options.compression)?;
    info!(
        "Importing {} into {} (compression: {})",
        options.path, options.database, detected.compression
    );

    if options.create_database {
        conn.execute(&dialect.create_database_sql(&options.database))
            .await?;
    }

    let mut stats = match detected.format {
        DumpFormat::PostgresArchive => {
            restore_archive(options).await?;
            ImportStats::empty(detected.compression, detected.format)
        }
        DumpFormat::PlainSql => {
            if options.resume_offset > 0 && detected.compression.is_compressed() {
                return Err(BackupError::ResumeUnsupported {
                    path: options.path.to_string(),
                });
            }
            conn.use_database(&options.database).await?;
            with_constraint_checks_disabled(conn, dialect, || {
                load_statements(conn, options, detected.compression)
            })
            .await?
        }
    };

    stats.duration = started.elapsed();
    info!(
        "Imported {} statements into {} in {:.1}s ({} errors)",
        stats.statements_executed,
        options.database,
        stats.duration.as_secs_f64(),
        stats.errors.len()
    );
    Ok(stats)
}

async fn restore_archive(options: &ImportOptions) -> Result<()> {
    match &options.archive_restorer {
        Some(restorer) => restorer.restore(&options.path, &options.database).await,
        None => {
            PgRestoreCommand::new()?
                .restore(&options.path, &options.database)
                .await
        }
    }
}

/// Disables the dialect's constraint checks around `body` and always puts
/// the saved values back.
async fn with_constraint_checks_disabled<F, Fut, T>(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut saved = Vec::new();
    for name in dialect.constraint_check_variables() {
        let result = conn.query(&dialect.session_variable_query(name)).await?;
        let value = result
            .rows
            .first()
            .and_then(|row| row.first())
            .map(|value| encode_value(value, dialect))
            .unwrap_or_else(|| "1".to_string());
        saved.push((*name, value));
    }

    let mut result = Ok(());
    for (name, _) in &saved {
        if let Err(e) = conn
            .execute(&dialect.set_session_variable_sql(name, "0"))
            .await
        {
            result = Err(BackupError::from(e));
            break;
        }
    }

    let outcome = match result {
        Ok(()) => body().await,
        Err(e) => Err(e),
    };

    let mut restore_error = None;
    for (name, value) in &saved {
        if let Err(e) = conn
            .execute(&dialect.set_session_variable_sql(name, value))
            .await
        {
            warn!("Failed to restore {} to {}: {}", name, value, e);
            restore_error.get_or_insert(e);
        }
    }

    match (outcome, restore_error) {
        (Ok(value), None) => Ok(value),
        (Ok(_), Some(e)) => Err(e.into()),
        (Err(e), _) => Err(e),
    }
}

async fn load_statements(
    conn: &dyn Connection,
    options: &ImportOptions,
    compression: Compression,
) -> Result<ImportStats> {
    let path = &options.path;
    let mut file = File::open(path).map_err(|e| BackupError::io(path, e))?;
    let total_bytes = if compression.is_compressed() {
        None
    } else {
        Some(
            file.metadata()
                .map_err(|e| BackupError::io(path, e))?
                .len(),
        )
    };

    if options.resume_offset > 0 {
        debug!("Resuming {} at byte {}", path, options.resume_offset);
        file.seek(SeekFrom::Start(options.resume_offset))
            .map_err(|e| BackupError::io(path, e))?;
    }

    let codec = codec_for(compression, options.external_codec)?;
    let reader = BufReader::with_capacity(buffer_size_for(total_bytes), codec.open_reader(file)?);
    let mut statements = StatementReader::with_offset(reader, options.resume_offset)
        .with_max_size(options.max_statement_size)
        .with_source_name(path.as_str());
    if let Some(delimiter) = &options.resume_delimiter {
        statements = statements.with_delimiter(delimiter.clone());
    }

    let batch_size = options
        .batch_size
        .unwrap_or_else(|| batch_size_for(total_bytes));
    let mut executor = BatchExecutor::new(
        conn,
        options.database.clone(),
        batch_size,
        options.error_policy.clone(),
    );
    let rename_filter = match &options.rename_from {
        Some(original) if *original != options.database => Some(rename_filter(original)?),
        _ => None,
    };

    let mut stats = ImportStats::empty(compression, DumpFormat::PlainSql);
    stats.total_bytes = total_bytes;
    let mut seen: u64 = 0;

    while let Some(statement) = statements.next_statement()? {
        stats.end_offset = statement.end_offset;
        if let Some(filter) = &rename_filter {
            if filter.is_match(&statement.sql) {
                debug!("Skipping statement naming the original database");
                stats.statements_skipped += 1;
                continue;
            }
        }

        executor.push(statement).await?;
        seen += 1;
        if seen % PROGRESS_INTERVAL == 0 {
            report(options, statements.position(), total_bytes, executor.statements_executed());
        }
    }

    stats.bytes_read = statements.position();
    stats.delimiter = statements.delimiter().to_string();
    let summary = executor.finish().await?;
    stats.statements_executed = summary.statements_executed;
    stats.errors = summary.errors;
    report(options, stats.bytes_read, total_bytes, stats.statements_executed);
    Ok(stats)
}

fn report(options: &ImportOptions, bytes_read: u64, total_bytes: Option<u64>, statements: u64) {
    emit(
        options.progress.as_ref(),
        ProgressEvent::ImportProgress {
            database: options.database.clone(),
            bytes_read,
            total_bytes,
            statements,
        },
    );
}

/// Matches `CREATE DATABASE`/`CREATE SCHEMA`/`USE` statements naming `database`.
fn rename_filter(database: &str) -> Result<Regex> {
    let name = regex::escape(database);
    let pattern = format!(
        r#"(?is)^\s*(?:CREATE\s+(?:DATABASE|SCHEMA)(?:\s+IF\s+NOT\s+EXISTS)?|USE)\s+[`"]?{}[`"]?(?:\s.*)?$"#,
        name
    );
    Regex::new(&pattern).map_err(|e| BackupError::InvalidOptions(e.to_string()))
}
