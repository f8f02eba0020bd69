//! Backup metadata format.
//!
//! `metadata.json` is the last file written into a backup directory. Its
//! presence is what makes a directory a complete backup.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compression::Compression;
use crate::error::{BackupError, Result};

/// Name of the metadata file inside a backup directory.
pub const METADATA_FILENAME: &str = "metadata.json";

const METADATA_TMP_FILENAME: &str = "metadata.json.tmp";

/// Description of one complete backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Backup id, also the directory name
    pub id: String,

    /// When the backup was started
    pub timestamp: DateTime<Utc>,

    /// Databases in requested order
    pub databases: Vec<String>,

    /// One file per database, same order as `databases`
    pub files: Vec<BackupFile>,

    /// Sum of file sizes in bytes
    pub total_size: u64,

    pub compression: Compression,

    pub server_version: String,

    pub server_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One database's dump artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFile {
    pub database: String,

    /// File name relative to the backup directory
    pub filename: String,

    /// Size on disk in bytes
    pub size: u64,

    /// Number of tables exported
    pub tables: usize,

    /// Number of rows exported
    pub rows: u64,

    /// SHA-256 of the file, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl BackupMetadata {
    /// Serializes the metadata to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserializes metadata from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads `metadata.json` from a backup directory.
    pub fn read(dir: &Utf8Path) -> Result<Self> {
        let path = metadata_path(dir);
        let json = fs::read_to_string(&path).map_err(|e| BackupError::io(&path, e))?;
        Self::from_json(&json)
    }

    /// Writes `metadata.json` into a backup directory.
    ///
    /// The JSON goes to a temporary file first and is renamed into place, so
    /// readers never observe a half-written metadata file.
    pub fn write(&self, dir: &Utf8Path) -> Result<()> {
        let json = self.to_json()?;
        let tmp = dir.join(METADATA_TMP_FILENAME);
        let path = metadata_path(dir);

        let mut file = fs::File::create(&tmp).map_err(|e| BackupError::io(&tmp, e))?;
        file.write_all(json.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| BackupError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|e| BackupError::io(&path, e))?;
        Ok(())
    }

    /// Looks up the file recorded for a database.
    pub fn file(&self, database: &str) -> Option<&BackupFile> {
        self.files.iter().find(|f| f.database == database)
    }

    /// Total rows across all files
    pub fn total_rows(&self) -> u64 {
        self.files.iter().map(|f| f.rows).sum()
    }

    /// Returns a human-readable size string.
    pub fn human_readable_size(&self) -> String {
        human_bytes(self.total_size)
    }
}

/// Path of the metadata file inside `dir`
pub fn metadata_path(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join(METADATA_FILENAME)
}

/// Formats bytes as a human-readable string.
fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample_metadata() -> BackupMetadata {
        BackupMetadata {
            id: "20240301-120000".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            databases: vec!["shop".to_string(), "crm".to_string()],
            files: vec![
                BackupFile {
                    database: "shop".to_string(),
                    filename: "shop.sql.gz".to_string(),
                    size: 1024,
                    tables: 3,
                    rows: 120,
                    checksum: Some("ab".repeat(32)),
                },
                BackupFile {
                    database: "crm".to_string(),
                    filename: "crm.sql.gz".to_string(),
                    size: 2048,
                    tables: 1,
                    rows: 5,
                    checksum: None,
                },
            ],
            total_size: 3072,
            compression: Compression::Gzip,
            server_version: "8.0.36".to_string(),
            server_type: "mysql".to_string(),
            profile: None,
            description: Some("nightly".to_string()),
        }
    }

    #[test]
    fn test_json_field_names() {
        let json = sample_metadata().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["id"], "20240301-120000");
        assert_eq!(value["timestamp"], "2024-03-01T12:00:00Z");
        assert_eq!(value["compression"], "gzip");
        assert_eq!(value["total_size"], 3072);
        assert_eq!(value["files"][0]["filename"], "shop.sql.gz");
        assert_eq!(value["files"][1]["tables"], 1);
        assert!(value["files"][1].get("checksum").is_none());
        assert!(value.get("profile").is_none());
        assert_eq!(value["description"], "nightly");
    }

    #[test]
    fn test_reads_minimal_metadata() {
        let json = r#"{
            "id": "20240101-000000",
            "timestamp": "2024-01-01T00:00:00Z",
            "databases": ["a"],
            "files": [{"database": "a", "filename": "a.sql", "size": 10, "tables": 1, "rows": 2}],
            "total_size": 10,
            "compression": "",
            "server_version": "10.11.6-MariaDB",
            "server_type": "mariadb"
        }"#;

        let metadata = BackupMetadata::from_json(json).unwrap();
        assert_eq!(metadata.compression, Compression::None);
        assert_eq!(metadata.file("a").unwrap().checksum, None);
        assert_eq!(metadata.total_rows(), 2);
    }

    #[test]
    fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(temp_dir.path()).unwrap();

        let metadata = sample_metadata();
        metadata.write(dir).unwrap();

        assert!(metadata_path(dir).exists());
        assert!(!dir.join(METADATA_TMP_FILENAME).exists());
        assert_eq!(BackupMetadata::read(dir).unwrap(), metadata);
    }

    #[test]
    fn test_read_missing_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(temp_dir.path()).unwrap();
        assert!(matches!(
            BackupMetadata::read(dir),
            Err(BackupError::Io { .. })
        ));
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1024), "1.00 KB");
        assert_eq!(human_bytes(5_242_880), "5.00 MB");
        assert_eq!(sample_metadata().human_readable_size(), "3.00 KB");
    }
}
