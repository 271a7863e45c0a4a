//! Configuration management for SegStore tables
//!
//! Provides durability presets for different workloads
//! (interactive curation vs. bulk pipeline import).

use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};
use crate::format::{MAX_KEY_SIZE, MAX_VALUE_SIZE};

/// Table configuration with durability presets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// Compaction trigger: checkpoint when dead WAL ratio exceeds this
    pub compaction_trigger_ratio: f64,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// fsync the WAL on every commit
    pub durable_commit: bool,
}

impl Config {
    /// Every commit reaches persistent media before `commit()` returns.
    pub fn durable() -> Self {
        Self {
            wal_rotation_size_bytes: 64 * 1024 * 1024,
            compaction_trigger_ratio: 0.5,
            max_key_size: MAX_KEY_SIZE,
            max_value_size: MAX_VALUE_SIZE,
            durable_commit: true,
        }
    }

    /// Pipeline import: commits land in the OS page cache, synced on rotation and checkpoint.
    pub fn bulk() -> Self {
        Self {
            wal_rotation_size_bytes: 256 * 1024 * 1024,
            compaction_trigger_ratio: 0.7,
            max_key_size: MAX_KEY_SIZE,
            max_value_size: MAX_VALUE_SIZE,
            durable_commit: false,
        }
    }

    /// Constrained disks: small WAL files, aggressive checkpointing.
    pub fn small() -> Self {
        Self {
            wal_rotation_size_bytes: 4 * 1024 * 1024,
            compaction_trigger_ratio: 0.3,
            max_key_size: MAX_KEY_SIZE,
            max_value_size: 8 * 1024 * 1024,
            durable_commit: true,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> KvResult<()> {
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return Err(KvError::InvalidConfig("wal_rotation_size_bytes must be >= 1MB".into()));
        }
        if self.compaction_trigger_ratio <= 0.0 || self.compaction_trigger_ratio >= 1.0 {
            return Err(KvError::InvalidConfig("compaction_trigger_ratio must be in (0.0, 1.0)".into()));
        }
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE {
            return Err(KvError::InvalidConfig(format!("max_key_size must be in [1, {}]", MAX_KEY_SIZE)));
        }
        if self.max_value_size == 0 || self.max_value_size > MAX_VALUE_SIZE {
            return Err(KvError::InvalidConfig("max_value_size must be in [1, 32MB]".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}
