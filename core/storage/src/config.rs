//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use offgrid_common::{Error, Result};

use crate::catalog::Catalog;

/// Default cache sweep interval in seconds.
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Configuration for opening an [`OfflineStore`](crate::OfflineStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. `None` keeps everything in memory.
    #[serde(default = "default_db_path")]
    pub path: Option<PathBuf>,
    /// Collections to create on open.
    #[serde(default)]
    pub catalog: Catalog,
    /// How often the optional cache sweeper runs. `None` disables it.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: Option<u64>,
}

impl StoreConfig {
    /// Configuration for a database at `path` with the standard catalog.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Configuration that never touches disk.
    pub fn memory_only() -> Self {
        Self {
            path: None,
            ..Self::default()
        }
    }

    /// Set the catalog.
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Parse configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            catalog: Catalog::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Platform data directory location, e.g. `~/.local/share/offgrid/offgrid.db`.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("offgrid").join("offgrid.db"))
}

fn default_sweep_interval() -> Option<u64> {
    Some(DEFAULT_SWEEP_INTERVAL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.catalog, Catalog::standard());
        assert_eq!(config.sweep_interval(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_from_json_with_catalog() {
        let config = StoreConfig::from_json(
            r#"{
                "path": "/tmp/offgrid-test.db",
                "catalog": [
                    { "collectionName": "spots", "keyField": "id", "indexes": [{ "field": "country" }] }
                ],
                "sweep_interval_secs": 0
            }"#,
        )
        .unwrap();

        assert_eq!(config.path, Some(PathBuf::from("/tmp/offgrid-test.db")));
        assert_eq!(config.catalog.len(), 1);
        assert_eq!(config.sweep_interval(), None);
    }

    #[test]
    fn test_memory_only_json() {
        let config = StoreConfig::from_json(r#"{ "path": null }"#).unwrap();
        assert!(config.path.is_none());
        assert_eq!(config.catalog.len(), 4);
    }

    #[test]
    fn test_invalid_catalog_is_config_error() {
        let err = StoreConfig::from_json(
            r#"{ "catalog": [{ "collectionName": "bad name", "keyField": "id" }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_bad_file_names_path_once() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("offgrid.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = StoreConfig::from_json_file(&path).unwrap_err();
        let Error::Config(message) = &err else {
            panic!("expected a config error, got {:?}", err);
        };
        assert!(message.starts_with(&path.display().to_string()));
        assert_eq!(err.to_string().matches("Configuration error").count(), 1);
    }

    #[test]
    fn test_missing_file() {
        let err = StoreConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
