//! SegStore Core: embedded transactional key-value tables
//!
//! Each table is a directory holding a RAM-resident `String -> String` map,
//! an SSD-backed write-ahead log and periodic snapshot checkpoints.
//!
//! # Architecture
//!
//! - **Read path**: Serve directly from RAM (pending overlay, then committed map)
//! - **Write path**: Stage in RAM; `commit()` appends one WAL batch (crash-safe)
//! - **Checkpoint**: `compact()` folds the WAL into a snapshot via atomic rename
//!
//! # No Domain Types
//!
//! This crate knows nothing about segmented objects or experiments.
//! The object graph and its key layout live in `segstore-dao`.

pub mod compaction;
pub mod config;
pub mod datafile;
pub mod error;
pub mod format;
pub mod platform_durability;
pub mod table;
pub mod wal;

// Re-export key types for convenience
pub use compaction::CheckpointResult;
pub use config::Config;
pub use datafile::{DataEntry, SnapshotReader, SnapshotWriter};
pub use error::{KvError, KvResult};
pub use format::Operation;
pub use table::KvTable;
pub use wal::{RecoveredLog, WalReader, WalWriter};
