//! Hierarchical configuration loader with precedence
//!
//! Loads configuration from multiple sources with the following precedence (low to high):
//! 1. Embedded defaults (built into binary)
//! 2. User config (`<config home>/dbkit/config.yaml`)
//! 3. Environment variables (DBKIT_* prefix)
//! 4. Explicit options passed by the caller (handled by caller)

use crate::error::{Error, Result};
use crate::types::DbkitConfig;
use crate::utils::{get_config_home, get_data_home};
use camino::{Utf8Path, Utf8PathBuf};
use rust_embed::RustEmbed;
use serde::de::DeserializeOwned;
use std::env;
use std::fs;
use std::str::FromStr;

/// Embedded configuration files
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/../../embedded/config/"]
#[prefix = ""]
struct EmbeddedConfigs;

/// Name of the user configuration file inside the config directory
pub const CONFIG_FILENAME: &str = "config.yaml";

/// Application directories, resolved once and injected into consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// `<data home>/dbkit`
    pub data_dir: Utf8PathBuf,
    /// `<config home>/dbkit`
    pub config_dir: Utf8PathBuf,
}

impl Paths {
    /// Create paths from explicit directories
    pub fn new(data_dir: impl Into<Utf8PathBuf>, config_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            config_dir: config_dir.into(),
        }
    }

    /// Resolve paths from the environment (XDG homes, then platform defaults)
    pub fn from_env() -> Result<Self> {
        let data = to_utf8(get_data_home()?)?;
        let config = to_utf8(get_config_home()?)?;
        Ok(Self::new(data.join("dbkit"), config.join("dbkit")))
    }

    /// Default backups root (`<data home>/dbkit/backups`)
    pub fn default_backups_dir(&self) -> Utf8PathBuf {
        self.data_dir.join("backups")
    }

    /// Backups root honouring an explicit override from configuration
    pub fn backups_dir(&self, config: &DbkitConfig) -> Utf8PathBuf {
        config
            .backup
            .backups_dir
            .clone()
            .unwrap_or_else(|| self.default_backups_dir())
    }
}

fn to_utf8(path: std::path::PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path)
        .map_err(|p| Error::invalid_config(format!("Non UTF-8 directory: {}", p.display())))
}

/// Configuration hierarchy loader
pub struct ConfigLoader {
    /// Directory holding `config.yaml`
    config_dir: Utf8PathBuf,
}

impl ConfigLoader {
    /// Create a loader for the resolved application paths
    pub fn new(paths: &Paths) -> Self {
        Self {
            config_dir: paths.config_dir.clone(),
        }
    }

    /// Create a loader with a custom config directory
    pub fn with_dir(config_dir: Utf8PathBuf) -> Self {
        Self { config_dir }
    }

    /// Load configuration with hierarchical precedence
    pub fn load(&self) -> Result<DbkitConfig> {
        // Start with embedded defaults
        let mut config = Self::load_embedded_config::<DbkitConfig>("defaults.yaml")?;

        // Load from user config if it exists
        let config_path = self.config_dir.join(CONFIG_FILENAME);
        if config_path.exists() {
            let file_config = self.load_yaml_file::<DbkitConfig>(&config_path)?;
            config = Self::merge_config(config, file_config);
            tracing::debug!("Loaded configuration from {}", config_path);
        }

        // Apply environment variable overrides
        config = self.apply_env_overrides(config)?;

        Ok(config)
    }

    /// Load an embedded configuration file
    fn load_embedded_config<T: DeserializeOwned>(filename: &str) -> Result<T> {
        let embedded_file = EmbeddedConfigs::get(filename).ok_or_else(|| {
            Error::config_not_found(format!("Embedded config not found: {}", filename))
        })?;

        let content = std::str::from_utf8(&embedded_file.data).map_err(|_| {
            Error::invalid_config(format!("Invalid UTF-8 in embedded config: {}", filename))
        })?;

        let config: T = serde_yaml_ng::from_str(content).map_err(|e| {
            Error::invalid_config(format!(
                "Failed to parse embedded config {}: {}",
                filename, e
            ))
        })?;

        Ok(config)
    }

    /// Load a YAML file and parse it
    fn load_yaml_file<T: DeserializeOwned>(&self, path: &Utf8Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        let config: T = serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse {}: {}", path, e)))?;
        Ok(config)
    }

    /// Merge two configs (base is overridden by overlay)
    fn merge_config(base: DbkitConfig, overlay: DbkitConfig) -> DbkitConfig {
        let mut backup = overlay.backup;
        if backup.backups_dir.is_none() {
            backup.backups_dir = base.backup.backups_dir;
        }
        DbkitConfig {
            backup,
            connection: overlay.connection,
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, mut config: DbkitConfig) -> Result<DbkitConfig> {
        if let Ok(val) = env::var("DBKIT_BACKUPS_DIR") {
            config.backup.backups_dir = Some(Utf8PathBuf::from(val));
        }

        if let Ok(val) = env::var("DBKIT_COMPRESSION") {
            config.backup.compression = val;
        }

        if let Some(val) = parse_env::<i32>("DBKIT_PARALLELISM")? {
            config.backup.parallelism = val;
        }

        if let Some(val) = parse_env::<usize>("DBKIT_EXPORT_BATCH_ROWS")? {
            config.backup.export_batch_rows = val;
        }

        if let Some(val) = parse_env::<usize>("DBKIT_FETCH_SIZE")? {
            config.backup.fetch_size = val;
        }

        if let Some(val) = parse_env::<usize>("DBKIT_MAX_STATEMENT_SIZE")? {
            config.backup.max_statement_size = val;
        }

        if let Some(val) = parse_env::<bool>("DBKIT_EXTERNAL_CODECS")? {
            config.backup.external_codecs = val;
        }

        if let Some(val) = parse_env::<u64>("DBKIT_LIVENESS_TIMEOUT_SECS")? {
            config.connection.liveness_timeout_secs = val;
        }

        Ok(config)
    }

    /// Get the config directory path
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_config(format!("{} has an invalid value '{}'", name, val))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn create_temp_loader() -> (ConfigLoader, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config_dir =
            Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf()).expect("Invalid UTF-8 path");
        let loader = ConfigLoader::with_dir(config_dir);
        (loader, temp_dir)
    }

    #[test]
    #[serial]
    fn test_load_defaults() {
        let (loader, _temp) = create_temp_loader();
        let config = loader.load().unwrap();
        assert_eq!(config.backup.compression, "gzip");
        assert_eq!(config.backup.export_batch_rows, 1000);
        assert_eq!(config.connection.liveness_timeout_secs, 5);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let (loader, _temp) = create_temp_loader();

        let config_content = r#"
backup:
  backups-dir: /var/lib/dbkit/backups
  compression: zstd
  parallelism: 3
connection:
  liveness-timeout-secs: 2
"#;
        fs::write(loader.config_dir().join(CONFIG_FILENAME), config_content).unwrap();

        let config = loader.load().unwrap();
        assert_eq!(config.backup.compression, "zstd");
        assert_eq!(config.backup.parallelism, 3);
        assert_eq!(
            config.backup.backups_dir,
            Some(Utf8PathBuf::from("/var/lib/dbkit/backups"))
        );
        assert_eq!(config.connection.liveness_timeout_secs, 2);
    }

    #[test]
    #[serial]
    fn test_invalid_file_is_reported() {
        let (loader, _temp) = create_temp_loader();
        fs::write(loader.config_dir().join(CONFIG_FILENAME), "backup: [not, a, map]").unwrap();

        let err = loader.load().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let (loader, _temp) = create_temp_loader();

        env::set_var("DBKIT_PARALLELISM", "-1");
        env::set_var("DBKIT_COMPRESSION", "xz");
        env::set_var("DBKIT_MAX_STATEMENT_SIZE", "1024");
        env::set_var("DBKIT_EXTERNAL_CODECS", "true");

        let config = loader.load().unwrap();
        assert_eq!(config.backup.parallelism, -1);
        assert_eq!(config.backup.compression, "xz");
        assert_eq!(config.backup.max_statement_size, 1024);
        assert!(config.backup.external_codecs);

        env::remove_var("DBKIT_PARALLELISM");
        env::remove_var("DBKIT_COMPRESSION");
        env::remove_var("DBKIT_MAX_STATEMENT_SIZE");
        env::remove_var("DBKIT_EXTERNAL_CODECS");
    }

    #[test]
    #[serial]
    fn test_invalid_env_override() {
        let (loader, _temp) = create_temp_loader();
        env::set_var("DBKIT_FETCH_SIZE", "lots");

        let err = loader.load().unwrap_err();
        assert!(err.to_string().contains("DBKIT_FETCH_SIZE"));

        env::remove_var("DBKIT_FETCH_SIZE");
    }

    #[test]
    #[serial]
    fn test_invalid_bool_env_override() {
        let (loader, _temp) = create_temp_loader();
        env::set_var("DBKIT_EXTERNAL_CODECS", "yes");

        let err = loader.load().unwrap_err();
        env::remove_var("DBKIT_EXTERNAL_CODECS");

        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(err.to_string().contains("DBKIT_EXTERNAL_CODECS"));
    }

    #[test]
    fn test_paths_backups_dir() {
        let paths = Paths::new("/data/dbkit", "/config/dbkit");
        let mut config = DbkitConfig::default();
        assert_eq!(
            paths.backups_dir(&config),
            Utf8PathBuf::from("/data/dbkit/backups")
        );

        config.backup.backups_dir = Some(Utf8PathBuf::from("/mnt/backups"));
        assert_eq!(paths.backups_dir(&config), Utf8PathBuf::from("/mnt/backups"));
    }

    #[test]
    #[serial]
    fn test_paths_from_env() {
        env::set_var("XDG_DATA_HOME", "/tmp/xdg-data");
        env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-config");

        let paths = Paths::from_env().unwrap();
        assert_eq!(paths.data_dir, Utf8PathBuf::from("/tmp/xdg-data/dbkit"));
        assert_eq!(paths.config_dir, Utf8PathBuf::from("/tmp/xdg-config/dbkit"));

        env::remove_var("XDG_DATA_HOME");
        env::remove_var("XDG_CONFIG_HOME");
    }
}
