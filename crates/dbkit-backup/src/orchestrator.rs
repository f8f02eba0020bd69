//! Multi-database backup and restore.
//!
//! A backup is a directory `<backups-root>/<id>/` holding one dump per
//! database plus `metadata.json`. The metadata file is written last, so a
//! directory without it is an unfinished or failed backup and is ignored by
//! [`BackupManager::list_backups`] and [`BackupManager::get_backup`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use dbkit_core::driver::{check_liveness, ConnectionProvider, Dialect};
use dbkit_core::{DbkitConfig, Paths};
use tracing::{debug, info, warn};

use crate::batch::ErrorPolicy;
use crate::compression::{calculate_checksum, Compression};
use crate::error::{BackupError, Result};
use crate::export::{export_sql, ExportOptions, DEFAULT_BATCH_ROWS, DEFAULT_FETCH_SIZE};
use crate::import::{import_sql, ImportOptions, ImportStats};
use crate::metadata::{metadata_path, BackupFile, BackupMetadata};
use crate::pool::{resolve_parallelism, TaskOutcome, WorkerPool};
use crate::progress::{emit, percent, progress_channel, ProgressEvent, ProgressSender};
use crate::tokenizer::DEFAULT_MAX_STATEMENT_SIZE;

/// Format of backup ids, derived from the creation time
pub const BACKUP_ID_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Settings injected into a [`BackupManager`] at construction.
#[derive(Debug, Clone)]
pub struct BackupManagerConfig {
    /// Directory holding one subdirectory per backup
    pub backups_root: Utf8PathBuf,
    /// Deadline for the connection check before a backup
    pub liveness_timeout: Duration,
    pub default_compression: Compression,
    /// 0 = sequential, negative = one job per CPU
    pub default_parallelism: i32,
    pub export_batch_rows: usize,
    pub fetch_size: usize,
    pub max_statement_size: usize,
    /// Pipe gzip/zstd through their binaries
    pub external_codecs: bool,
}

impl BackupManagerConfig {
    pub fn new(backups_root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            backups_root: backups_root.into(),
            liveness_timeout: Duration::from_secs(5),
            default_compression: Compression::Gzip,
            default_parallelism: 0,
            export_batch_rows: DEFAULT_BATCH_ROWS,
            fetch_size: DEFAULT_FETCH_SIZE,
            max_statement_size: DEFAULT_MAX_STATEMENT_SIZE,
            external_codecs: false,
        }
    }

    /// Builds the settings from loaded configuration.
    pub fn from_config(paths: &Paths, config: &DbkitConfig) -> Result<Self> {
        Ok(Self {
            backups_root: paths.backups_dir(config),
            liveness_timeout: Duration::from_secs(config.connection.liveness_timeout_secs),
            default_compression: Compression::parse(&config.backup.compression)?,
            default_parallelism: config.backup.parallelism,
            export_batch_rows: config.backup.export_batch_rows,
            fetch_size: config.backup.fetch_size,
            max_statement_size: config.backup.max_statement_size,
            external_codecs: config.backup.external_codecs,
        })
    }
}

/// Options for [`BackupManager::create_backup`].
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Databases in the order they should be recorded; empty means every
    /// non-system database
    pub databases: Vec<String>,
    /// Overrides the configured compression
    pub compression: Option<Compression>,
    /// Overrides the configured parallelism
    pub parallelism: Option<i32>,
    /// Table glob patterns excluded in every database
    pub exclude_tables: Vec<String>,
    pub structure_only: bool,
    pub profile: Option<String>,
    pub description: Option<String>,
    pub progress: Option<ProgressSender>,
}

/// Options for [`BackupManager::restore_backup`].
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    pub backup_id: String,
    /// Databases to restore; empty means all recorded ones
    pub databases: Vec<String>,
    /// Source database name -> target database name
    pub rename: HashMap<String, String>,
    /// Drop each target database before loading it
    pub drop_existing: bool,
    pub parallelism: Option<i32>,
    pub verify_checksums: bool,
    pub error_policy: ErrorPolicy,
    /// Receives [`ProgressEvent::DatabasePercent`] per database
    pub progress: Option<ProgressSender>,
}

impl RestoreOptions {
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            databases: Vec::new(),
            rename: HashMap::new(),
            drop_existing: false,
            parallelism: None,
            verify_checksums: true,
            error_policy: ErrorPolicy::default(),
            progress: None,
        }
    }
}

/// Result of restoring one database.
#[derive(Debug, Clone)]
pub struct RestoredDatabase {
    /// Name recorded in the backup
    pub source: String,
    /// Name it was restored as
    pub target: String,
    pub stats: ImportStats,
}

/// Creates, restores, lists and deletes backups.
pub struct BackupManager {
    config: BackupManagerConfig,
    provider: Arc<dyn ConnectionProvider>,
    dialect: Arc<dyn Dialect>,
}

impl BackupManager {
    pub fn new(
        config: BackupManagerConfig,
        provider: Arc<dyn ConnectionProvider>,
        dialect: Arc<dyn Dialect>,
    ) -> Self {
        Self {
            config,
            provider,
            dialect,
        }
    }

    pub fn backups_root(&self) -> &Utf8Path {
        &self.config.backups_root
    }

    /// Directory of a backup id (whether or not it exists)
    pub fn backup_dir(&self, id: &str) -> Utf8PathBuf {
        self.config.backups_root.join(id)
    }

    /// Acquires a session and pings it within the liveness timeout.
    pub async fn check_connection(&self) -> Result<()> {
        let conn = self.provider.acquire().await?;
        check_liveness(conn.as_ref(), self.config.liveness_timeout).await?;
        Ok(())
    }

    /// Backs up one or more databases.
    ///
    /// Every database is exported by its own job on its own session. If any
    /// job fails the whole backup directory is removed and the failure of the
    /// earliest requested database is returned.
    pub async fn create_backup(&self, options: BackupOptions) -> Result<BackupMetadata> {
        info!("Stage 1/3: Resolving databases");
        let conn = self.provider.acquire().await?;
        check_liveness(conn.as_ref(), self.config.liveness_timeout).await?;

        let databases = if options.databases.is_empty() {
            let system = self.dialect.system_databases();
            conn.query(&self.dialect.list_databases_sql())
                .await?
                .first_column_text()
                .into_iter()
                .filter(|db| !system.contains(&db.as_str()))
                .collect::<Vec<_>>()
        } else {
            unique_names(&options.databases)
        };
        if databases.is_empty() {
            return Err(BackupError::InvalidOptions(
                "No databases to back up".to_string(),
            ));
        }
        let server_version = conn.server_version();
        let server_type = conn.server_type();
        drop(conn);

        let compression = options
            .compression
            .unwrap_or(self.config.default_compression);
        let timestamp = Utc::now();
        let (id, dir) = self.allocate_backup_dir(timestamp)?;

        let dop = resolve_parallelism(
            options.parallelism.unwrap_or(self.config.default_parallelism),
            databases.len(),
        );
        info!(
            "Stage 2/3: Exporting {} databases to {} (parallelism {})",
            databases.len(),
            dir,
            dop
        );

        let total = databases.len();
        let jobs: Vec<_> = databases
            .iter()
            .enumerate()
            .map(|(index, database)| {
                let filename = format!("{}.sql{}", database, compression.extension());
                let mut export = ExportOptions::new(dir.join(&filename), database.clone());
                export.exclude_tables = options.exclude_tables.clone();
                export.batch_rows = self.config.export_batch_rows;
                export.fetch_size = self.config.fetch_size;
                export.compression = compression;
                export.external_codec = self.config.external_codecs;
                export.structure_only = options.structure_only;
                export.progress = options.progress.clone();

                let provider = self.provider.clone();
                let dialect = self.dialect.clone();
                let database = database.clone();
                move || async move {
                    export_job(provider, dialect, export, filename, index + 1, total)
                        .await
                        .map_err(|e| BackupError::partial_backup(database, e))
                }
            })
            .collect();

        let outcomes = WorkerPool::new(dop).run(jobs).await;
        let files = match collect_outcomes(&databases, outcomes, BackupError::partial_backup) {
            Ok(files) => files,
            Err(e) => {
                warn!("Backup {} failed, removing {}", id, dir);
                remove_backup_dir(&dir);
                return Err(e);
            }
        };

        info!("Stage 3/3: Writing metadata");
        let metadata = BackupMetadata {
            id: id.clone(),
            timestamp,
            databases,
            total_size: files.iter().map(|f| f.size).sum(),
            files,
            compression,
            server_version,
            server_type,
            profile: options.profile,
            description: options.description,
        };
        if let Err(e) = metadata.write(&dir) {
            remove_backup_dir(&dir);
            return Err(e);
        }

        info!(
            "Backup {} complete: {} databases, {}",
            id,
            metadata.databases.len(),
            metadata.human_readable_size()
        );
        Ok(metadata)
    }

    /// Restores databases from a backup.
    ///
    /// Databases restored before a failure are left in place.
    pub async fn restore_backup(&self, options: RestoreOptions) -> Result<Vec<RestoredDatabase>> {
        let metadata = self.get_backup(&options.backup_id)?;
        let dir = self.backup_dir(&metadata.id);

        let selected: Vec<BackupFile> = if options.databases.is_empty() {
            metadata.files.clone()
        } else {
            unique_names(&options.databases)
                .iter()
                .map(|db| {
                    metadata.file(db).cloned().ok_or_else(|| {
                        BackupError::InvalidOptions(format!(
                            "Database '{}' is not part of backup {}",
                            db, metadata.id
                        ))
                    })
                })
                .collect::<Result<_>>()?
        };

        info!(
            "Stage 1/2: Verifying {} files of backup {}",
            selected.len(),
            metadata.id
        );
        if options.verify_checksums {
            for file in &selected {
                verify_file(&dir, file).map_err(|e| BackupError::restore(&file.database, e))?;
            }
        }

        let targets: Vec<String> = selected
            .iter()
            .map(|f| {
                options
                    .rename
                    .get(&f.database)
                    .cloned()
                    .unwrap_or_else(|| f.database.clone())
            })
            .collect();

        let dop = resolve_parallelism(
            options.parallelism.unwrap_or(self.config.default_parallelism),
            selected.len(),
        );
        info!(
            "Stage 2/2: Restoring {} databases (parallelism {})",
            selected.len(),
            dop
        );

        let total = selected.len();
        let jobs: Vec<_> = selected
            .iter()
            .zip(&targets)
            .enumerate()
            .map(|(index, (file, target))| {
                let mut import = ImportOptions::new(dir.join(&file.filename), target.clone());
                import.create_database = true;
                import.rename_from = Some(file.database.clone());
                import.compression = Some(metadata.compression);
                import.external_codec = self.config.external_codecs;
                import.max_statement_size = self.config.max_statement_size;
                import.error_policy = options.error_policy.clone();

                let job = RestoreJob {
                    provider: self.provider.clone(),
                    dialect: self.dialect.clone(),
                    source: file.database.clone(),
                    import,
                    drop_existing: options.drop_existing,
                    progress: options.progress.clone(),
                    index: index + 1,
                    total,
                };
                let target = target.clone();
                move || async move {
                    job.run()
                        .await
                        .map_err(|e| BackupError::restore(target, e))
                }
            })
            .collect();

        let outcomes = WorkerPool::new(dop).run(jobs).await;
        let restored = collect_outcomes(&targets, outcomes, BackupError::restore)?;

        info!("Restore of backup {} complete", metadata.id);
        Ok(restored)
    }

    /// Lists complete backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupMetadata>> {
        let root = &self.config.backups_root;
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut backups = Vec::new();
        for entry in root.read_dir_utf8().map_err(|e| BackupError::io(root, e))? {
            let entry = entry.map_err(|e| BackupError::io(root, e))?;
            let dir = entry.path();
            if !dir.is_dir() || !metadata_path(dir).is_file() {
                continue;
            }
            match BackupMetadata::read(dir) {
                Ok(metadata) => backups.push(metadata),
                Err(e) => warn!("Skipping unreadable backup {}: {}", dir, e),
            }
        }

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(backups)
    }

    /// Loads one backup's metadata.
    pub fn get_backup(&self, id: &str) -> Result<BackupMetadata> {
        validate_backup_id(id)?;
        let dir = self.backup_dir(id);
        if !metadata_path(&dir).is_file() {
            return Err(BackupError::NotFound(id.to_string()));
        }
        BackupMetadata::read(&dir)
    }

    /// Removes a backup directory, complete or not.
    pub fn delete_backup(&self, id: &str) -> Result<()> {
        validate_backup_id(id)?;
        let dir = self.backup_dir(id);
        if !dir.is_dir() {
            return Err(BackupError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir).map_err(|e| BackupError::io(&dir, e))?;
        info!("Deleted backup {}", id);
        Ok(())
    }

    /// Claims a fresh directory named after `timestamp`, adding `-N` when a
    /// backup with the same second already exists.
    fn allocate_backup_dir(&self, timestamp: DateTime<Utc>) -> Result<(String, Utf8PathBuf)> {
        let root = &self.config.backups_root;
        fs::create_dir_all(root).map_err(|e| BackupError::io(root, e))?;

        let base = timestamp.format(BACKUP_ID_FORMAT).to_string();
        let mut suffix = 0u32;
        loop {
            let id = if suffix == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, suffix)
            };
            let dir = root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!("Allocated backup directory {}", dir);
                    return Ok((id, dir));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(BackupError::io(&dir, e)),
            }
        }
    }
}

async fn export_job(
    provider: Arc<dyn ConnectionProvider>,
    dialect: Arc<dyn Dialect>,
    options: ExportOptions,
    filename: String,
    index: usize,
    total: usize,
) -> Result<BackupFile> {
    emit(
        options.progress.as_ref(),
        ProgressEvent::DatabaseStarted {
            database: options.database.clone(),
            index,
            total,
        },
    );

    let conn = provider.acquire().await?;
    let stats = export_sql(conn.as_ref(), dialect.as_ref(), &options).await?;
    let checksum = calculate_checksum(options.path.as_std_path())?;

    emit(
        options.progress.as_ref(),
        ProgressEvent::DatabaseFinished {
            database: options.database.clone(),
        },
    );

    Ok(BackupFile {
        database: options.database,
        filename,
        size: stats.file_size,
        tables: stats.tables,
        rows: stats.rows,
        checksum: Some(checksum),
    })
}

struct RestoreJob {
    provider: Arc<dyn ConnectionProvider>,
    dialect: Arc<dyn Dialect>,
    source: String,
    import: ImportOptions,
    drop_existing: bool,
    progress: Option<ProgressSender>,
    index: usize,
    total: usize,
}

impl RestoreJob {
    async fn run(mut self) -> Result<RestoredDatabase> {
        let target = self.import.database.clone();
        emit(
            self.progress.as_ref(),
            ProgressEvent::DatabaseStarted {
                database: target.clone(),
                index: self.index,
                total: self.total,
            },
        );

        let conn = self.provider.acquire().await?;
        if self.drop_existing {
            debug!("Dropping existing database {}", target);
            conn.execute(&self.dialect.drop_database_sql(&target))
                .await?;
        }

        // Import reports bytes; callers get percentages
        let forwarder = self.progress.clone().map(|caller| {
            let (tx, mut rx) = progress_channel();
            self.import.progress = Some(tx);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let ProgressEvent::ImportProgress {
                        database,
                        bytes_read,
                        total_bytes,
                        statements,
                    } = event
                    {
                        let _ = caller.send(ProgressEvent::DatabasePercent {
                            database,
                            percent: percent(bytes_read, total_bytes),
                            statements,
                        });
                    }
                }
            })
        });

        let result = import_sql(conn.as_ref(), self.dialect.as_ref(), &self.import).await;
        self.import.progress = None;
        if let Some(handle) = forwarder {
            let _ = handle.await;
        }
        let stats = result?;

        emit(
            self.progress.as_ref(),
            ProgressEvent::DatabaseFinished {
                database: target.clone(),
            },
        );
        Ok(RestoredDatabase {
            source: self.source,
            target,
            stats,
        })
    }
}

/// Reassembles pool outcomes in request order. The first failing request
/// (lowest index) determines the error.
fn collect_outcomes<T>(
    names: &[String],
    outcomes: Vec<TaskOutcome<T, BackupError>>,
    wrap_panic: fn(String, BackupError) -> BackupError,
) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut first_error = None;

    for (name, outcome) in names.iter().zip(outcomes) {
        match outcome {
            TaskOutcome::Completed(Ok(value)) => values.push(value),
            TaskOutcome::Completed(Err(e)) => {
                first_error.get_or_insert(e);
            }
            TaskOutcome::Panicked(message) => {
                first_error.get_or_insert_with(|| {
                    wrap_panic(name.clone(), BackupError::Panicked(message))
                });
            }
            TaskOutcome::Skipped => {}
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

/// Drops repeated names, keeping the first occurrence.
fn unique_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(names.len());
    for name in names {
        if seen.insert(name.as_str()) {
            unique.push(name.clone());
        } else {
            warn!("Database {} requested more than once, using it once", name);
        }
    }
    unique
}

fn verify_file(dir: &Utf8Path, file: &BackupFile) -> Result<()> {
    let path = dir.join(&file.filename);
    if !path.is_file() {
        return Err(BackupError::io(
            &path,
            io::Error::new(io::ErrorKind::NotFound, "dump file missing"),
        ));
    }
    if let Some(expected) = &file.checksum {
        let actual = calculate_checksum(path.as_std_path())?;
        if &actual != expected {
            return Err(BackupError::ChecksumMismatch {
                path: path.to_string(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

fn remove_backup_dir(dir: &Utf8Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        warn!("Failed to remove backup directory {}: {}", dir, e);
    }
}

/// Rejects ids that would escape the backups root.
fn validate_backup_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BackupError::InvalidOptions(format!(
            "Invalid backup id '{}'",
            id
        )))
    }
}
