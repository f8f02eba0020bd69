//! SQL dump writer.
//!
//! Writes one database as plain SQL: a provenance header, saved session
//! variables, the dialect prologue, then per table an optional `DROP TABLE`,
//! the creation statement and multi-row `INSERT`s, and finally the dialect
//! epilogue. Output goes through a [`BatchWriter`] into the selected codec.

use std::fs::{self, File};
use std::io::Write;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::Utc;
use dbkit_core::driver::{Connection, Dialect, QueryResult};
use dbkit_core::Error as CoreError;
use tracing::{debug, info, warn};

use crate::bufio::{BatchWriter, DEFAULT_BUFFER};
use crate::compression::{codec_for, Compression, EncodeWriter};
use crate::error::{BackupError, Result};
use crate::filters::TableFilter;
use crate::progress::{emit, ProgressEvent, ProgressSender};
use crate::values::{encode_row, encode_value};

/// Rows per `INSERT` statement by default
pub const DEFAULT_BATCH_ROWS: usize = 1000;

/// Rows fetched per page query by default
pub const DEFAULT_FETCH_SIZE: usize = 10_000;

/// Unflushed bytes that force a flush by default
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

/// Configuration for one database export.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Output file
    pub path: Utf8PathBuf,
    pub database: String,
    /// Tables to export in order; empty means all
    pub tables: Vec<String>,
    /// Glob patterns of tables to leave out
    pub exclude_tables: Vec<String>,
    /// Rows per `INSERT`
    pub batch_rows: usize,
    /// Rows per page query
    pub fetch_size: usize,
    pub buffer_size: usize,
    pub flush_threshold: usize,
    pub compression: Compression,
    /// Use the codec binary instead of the in-process encoder
    pub external_codec: bool,
    /// Emit `DROP TABLE IF EXISTS` before each table
    pub drop_table: bool,
    /// Schema only, no rows
    pub structure_only: bool,
    /// Session variables whose current values are written at the top
    pub session_variables: Vec<String>,
    /// Read every table inside one consistent snapshot
    pub consistent_snapshot: bool,
    pub progress: Option<ProgressSender>,
}

impl ExportOptions {
    pub fn new(path: impl Into<Utf8PathBuf>, database: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            database: database.into(),
            tables: Vec::new(),
            exclude_tables: Vec::new(),
            batch_rows: DEFAULT_BATCH_ROWS,
            fetch_size: DEFAULT_FETCH_SIZE,
            buffer_size: DEFAULT_BUFFER,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            compression: Compression::None,
            external_codec: false,
            drop_table: true,
            structure_only: false,
            session_variables: Vec::new(),
            consistent_snapshot: true,
            progress: None,
        }
    }
}

/// Outcome of one export.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportStats {
    pub tables: usize,
    pub rows: u64,
    /// Uncompressed SQL bytes produced
    pub bytes_written: u64,
    /// Size of the output file on disk
    pub file_size: u64,
    pub duration: Duration,
    pub compression: Compression,
}

/// Exports one database to `options.path`.
///
/// On failure the partially written file is removed.
pub async fn export_sql(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    options: &ExportOptions,
) -> Result<ExportStats> {
    let started = Instant::now();
    info!(
        "Exporting database {} to {}",
        options.database, options.path
    );

    let result = write_dump(conn, dialect, options).await;
    match result {
        Ok(mut stats) => {
            stats.file_size = fs::metadata(&options.path)
                .map_err(|e| BackupError::io(&options.path, e))?
                .len();
            stats.duration = started.elapsed();
            info!(
                "Exported {} tables ({} rows) from {} in {:.1}s",
                stats.tables,
                stats.rows,
                options.database,
                stats.duration.as_secs_f64()
            );
            Ok(stats)
        }
        Err(e) => {
            if options.path.exists() {
                if let Err(rm) = fs::remove_file(&options.path) {
                    warn!("Failed to remove partial dump {}: {}", options.path, rm);
                }
            }
            Err(e)
        }
    }
}

async fn write_dump(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    options: &ExportOptions,
) -> Result<ExportStats> {
    conn.use_database(&options.database).await?;
    if !options.consistent_snapshot {
        return write_body(conn, dialect, options).await;
    }

    for statement in dialect.begin_snapshot_sql() {
        conn.execute(&statement).await?;
    }
    let result = write_body(conn, dialect, options).await;
    for statement in dialect.end_snapshot_sql() {
        if let Err(e) = conn.execute(&statement).await {
            warn!("Failed to release export snapshot: {}", e);
        }
    }
    result
}

async fn write_body(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    options: &ExportOptions,
) -> Result<ExportStats> {
    let available = conn
        .query(&dialect.list_tables_sql(&options.database))
        .await?
        .first_column_text();
    let filter = TableFilter::new(options.tables.clone(), &options.exclude_tables)?;
    let tables = filter.select(&available)?;
    debug!("{} of {} tables selected", tables.len(), available.len());

    let saved_variables = save_session_variables(conn, dialect, &options.session_variables).await?;

    let file = File::create(&options.path).map_err(|e| BackupError::io(&options.path, e))?;
    let codec = codec_for(options.compression, options.external_codec)?;
    let mut out = DumpWriter {
        inner: BatchWriter::new(
            codec.create_writer(file)?,
            options.buffer_size,
            options.flush_threshold,
        ),
        path: options.path.to_string(),
    };

    out.line(&format!(
        "-- dbkit SQL dump {}",
        env!("CARGO_PKG_VERSION")
    ))?;
    out.line(&format!(
        "-- Server: {} {}",
        conn.server_type(),
        conn.server_version()
    ))?;
    out.line(&format!("-- Database: {}", options.database))?;
    out.line(&format!("-- Created: {}", Utc::now().to_rfc3339()))?;
    out.line("")?;

    for statement in &saved_variables {
        out.statement(statement)?;
    }
    for statement in dialect.export_prologue() {
        out.statement(&statement)?;
    }

    let mut stats = ExportStats {
        compression: options.compression,
        ..Default::default()
    };

    let total = tables.len();
    for (i, table) in tables.iter().enumerate() {
        let rows = export_table(conn, dialect, options, table, &mut out).await?;
        stats.tables += 1;
        stats.rows += rows;

        emit(
            options.progress.as_ref(),
            ProgressEvent::TableExported {
                database: options.database.clone(),
                table: table.clone(),
                index: i + 1,
                total,
                rows,
            },
        );
    }

    out.line("")?;
    for statement in dialect.export_epilogue() {
        out.statement(&statement)?;
    }

    stats.bytes_written = out.inner.bytes_written();
    out.finish()?;
    Ok(stats)
}

async fn export_table(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    options: &ExportOptions,
    table: &str,
    out: &mut DumpWriter,
) -> Result<u64> {
    let quoted = dialect.quote_identifier(table);
    debug!("Exporting table {}.{}", options.database, table);

    out.line("")?;
    out.line(&format!("-- Table structure for {}", quoted))?;
    if options.drop_table {
        out.statement(&dialect.drop_table_sql(table))?;
    }
    out.statement(&create_table_statement(conn, dialect, table).await?)?;

    if options.structure_only {
        return Ok(0);
    }

    out.line("")?;
    out.line(&format!("-- Data for {}", quoted))?;

    let order_by = conn
        .query(&dialect.order_columns_query(&options.database, table))
        .await?
        .first_column_text();
    let fetch_size = options.fetch_size.max(1);
    let batch_rows = options.batch_rows.max(1);
    let mut offset: u64 = 0;
    let mut rows: u64 = 0;

    loop {
        let page = conn
            .query(&dialect.select_page_sql(table, &order_by, fetch_size, offset))
            .await?;
        if page.rows.is_empty() {
            break;
        }

        let prefix = insert_prefix(dialect, &quoted, &page);
        for chunk in page.rows.chunks(batch_rows) {
            let values: Vec<String> = chunk.iter().map(|row| encode_row(row, dialect)).collect();
            out.statement(&format!("{}{}", prefix, values.join(",\n")))?;
        }

        let fetched = page.rows.len();
        rows += fetched as u64;
        offset += fetched as u64;
        if fetched < fetch_size {
            break;
        }
    }

    Ok(rows)
}

fn insert_prefix(dialect: &dyn Dialect, quoted_table: &str, page: &QueryResult) -> String {
    if page.columns.is_empty() {
        return format!("INSERT INTO {} VALUES\n", quoted_table);
    }
    let columns: Vec<String> = page
        .columns
        .iter()
        .map(|c| dialect.quote_identifier(c))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES\n",
        quoted_table,
        columns.join(", ")
    )
}

async fn create_table_statement(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    table: &str,
) -> Result<String> {
    let query = dialect.create_table_query(table);
    let result = conn.query(&query).await?;
    result
        .cell_text(0, dialect.create_table_column())
        .ok_or_else(|| {
            CoreError::unexpected_result(&query, "no creation statement returned").into()
        })
}

/// Reads the current values of `names` and renders them as assignments,
/// keeping each value's type so numeric variables stay unquoted.
async fn save_session_variables(
    conn: &dyn Connection,
    dialect: &dyn Dialect,
    names: &[String],
) -> Result<Vec<String>> {
    let mut statements = Vec::with_capacity(names.len());
    for name in names {
        let result = conn.query(&dialect.session_variable_query(name)).await?;
        let literal = match result.rows.first().and_then(|row| row.first()) {
            Some(value) => encode_value(value, dialect),
            None => "NULL".to_string(),
        };
        statements.push(dialect.set_session_variable_sql(name, &literal));
    }
    Ok(statements)
}

struct DumpWriter {
    inner: BatchWriter<Box<dyn EncodeWriter>>,
    path: String,
}

impl DumpWriter {
    fn line(&mut self, text: &str) -> Result<()> {
        self.inner
            .write_all(text.as_bytes())
            .and_then(|_| self.inner.write_all(b"\n"))
            .map_err(|e| BackupError::io(&self.path, e))
    }

    fn statement(&mut self, sql: &str) -> Result<()> {
        self.inner
            .write_all(sql.as_bytes())
            .and_then(|_| self.inner.write_all(b";\n"))
            .map_err(|e| BackupError::io(&self.path, e))
    }

    fn finish(self) -> Result<()> {
        let path = self.path;
        let encoder = self
            .inner
            .into_inner()
            .map_err(|e| BackupError::io(&path, e))?;
        encoder.finish().map_err(|e| BackupError::io(&path, e))
    }
}
