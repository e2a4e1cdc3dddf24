//! Engine configuration
//!
//! Loadable from YAML; every section has defaults so a partial file works.

use crate::index::{DEFAULT_ORDER, MIN_ORDER};
use crate::transaction::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config syntax: {0}")]
    Syntax(#[from] serde_yaml::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Filesystem,
    Rocksdb,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub path: Option<PathBuf>,
    /// Blocks kept in the LRU cache; 0 disables it
    pub cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: BackendKind::Memory,
            path: None,
            cache_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub sync_on_commit: bool,
    /// Commits between automatic checkpoints; 0 means manual only
    pub checkpoint_interval: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            sync_on_commit: true,
            checkpoint_interval: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub default_isolation: IsolationLevel,
    pub query_timeout_ms: Option<u64>,
}

impl TransactionConfig {
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub btree_order: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            btree_order: DEFAULT_ORDER,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub wal: WalConfig,
    pub transactions: TransactionConfig,
    pub index: IndexConfig,
}

impl EngineConfig {
    /// In-memory engine with default settings
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: BackendKind, path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.backend = backend;
        config.storage.path = Some(path.into());
        config
    }

    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.index.btree_order < MIN_ORDER {
            return Err(ConfigError::Invalid(format!(
                "index.btree_order must be at least {}, got {}",
                MIN_ORDER, self.index.btree_order
            )));
        }
        if self.storage.backend != BackendKind::Memory && self.storage.path.is_none() {
            return Err(ConfigError::Invalid(format!(
                "storage.path is required for the {:?} backend",
                self.storage.backend
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.storage.cache_capacity, 1024);
        assert!(config.wal.sync_on_commit);
        assert_eq!(config.transactions.default_isolation, IsolationLevel::ReadCommitted);
        assert_eq!(config.index.btree_order, DEFAULT_ORDER);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let config = EngineConfig::from_yaml_str(
            "storage:\n  backend: filesystem\n  path: /tmp/graph\ntransactions:\n  default_isolation: serializable\n  query_timeout_ms: 250\nindex:\n  btree_order: 4\n",
        )
        .unwrap();
        assert_eq!(config.storage.backend, BackendKind::Filesystem);
        assert_eq!(config.storage.cache_capacity, 1024);
        assert_eq!(config.transactions.default_isolation, IsolationLevel::Serializable);
        assert_eq!(config.transactions.query_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.index.btree_order, 4);
        assert_eq!(EngineConfig::from_yaml_str(&config.to_yaml().unwrap()).unwrap(), config);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            EngineConfig::from_yaml_str("index:\n  btree_order: 2\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("storage:\n  backend: rocksdb\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(EngineConfig::from_yaml_str("wal: [1"), Err(ConfigError::Syntax(_))));
    }
}
