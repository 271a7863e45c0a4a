//! Dataset store configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use segstore_core::Config;

use crate::error::{DaoError, DaoResult};

/// Position stores kept open at once unless configured otherwise.
pub const DEFAULT_MAX_OPEN_POSITIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Position stores kept open at once; the least recently used is evicted beyond this
    pub max_open_positions: usize,
    /// Ask before committing pending writes on eviction or unlock
    pub safe_mode: bool,
    /// Never try to take locks; every store is read-only
    pub read_only: bool,
    /// Settings of every per-class table
    pub table: Config,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_open_positions: DEFAULT_MAX_OPEN_POSITIONS,
            safe_mode: false,
            read_only: false,
            table: Config::default(),
        }
    }
}

impl StoreConfig {
    pub fn read_only() -> Self {
        Self { read_only: true, ..Self::default() }
    }

    /// Load from a JSON file; absent fields take their defaults.
    pub fn from_json_file(path: &Path) -> DaoResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| DaoError::io(path, e))?;
        let config: StoreConfig = serde_json::from_str(&text)
            .map_err(|e| DaoError::serialization(format!("store config {}", path.display()), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DaoResult<()> {
        if self.max_open_positions == 0 {
            return Err(segstore_core::KvError::InvalidConfig("max_open_positions must be >= 1".into()).into());
        }
        self.table.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.max_open_positions, 5);
        assert!(!config.safe_mode);
        assert!(config.validate().is_ok());
        assert!(StoreConfig::read_only().read_only);
    }

    #[test]
    fn test_partial_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{"max_open_positions": 2, "table": {"durable_commit": false}}"#).unwrap();

        let config = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_open_positions, 2);
        assert!(!config.table.durable_commit);
        assert_eq!(config.table.max_key_size, Config::default().max_key_size);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = StoreConfig { max_open_positions: 0, ..StoreConfig::default() };
        assert!(config.validate().is_err());
    }
}
