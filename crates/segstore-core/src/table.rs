//! Transactional string table: the unit of storage of SegStore.
//!
//! KvTable combines a RAM hash map with a crash-safe WAL and snapshot
//! checkpoints. Writes go to a pending overlay until `commit()`.
//!
//! **Read path**: pending overlay first, then the committed map (RwLock)
//! **Write path**: overlay only; `commit()` writes one WAL batch, then applies it to RAM
//! **Checkpoint**: `compact()` folds the WAL into a snapshot file
//!
//! On-disk layout of a table directory:
//! ```text
//! <table>/
//!   wal/   wal-{seq}.segs       committed batches since the last checkpoint
//!   data/  snapshot-{seq}.segs  live entries at the last checkpoint
//! ```

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::compaction::{checkpoint, needs_checkpoint, remove_stale_temp_files, CheckpointResult};
use crate::config::Config;
use crate::datafile::{list_snapshots, SnapshotReader};
use crate::error::{KvError, KvResult};
use crate::format::{check_sizes, Operation, HEADER_SIZE};
use crate::wal::{WalReader, WalWriter};

/// A persistent, transactional `String -> String` map.
///
/// All public methods take `&self` for concurrent access.
/// Readers see their own uncommitted writes: the overlay is shared by every
/// handle on the table, like a single open transaction.
pub struct KvTable {
    /// Committed state
    data: RwLock<HashMap<String, String>>,
    /// Uncommitted writes; `None` marks a removal
    pending: Mutex<HashMap<String, Option<String>>>,
    /// Commit log; absent when opened read-only
    wal: Option<Mutex<WalWriter>>,
    /// Table directory
    path: PathBuf,
    config: Config,
}

fn into_string(bytes: Vec<u8>, path: &Path, component: &str) -> KvResult<String> {
    String::from_utf8(bytes).map_err(|_| KvError::InvalidUtf8 {
        path: path.to_path_buf(),
        component: component.to_string(),
    })
}

impl KvTable {
    /// Open or create a table at the given directory.
    ///
    /// Loads the latest snapshot, then replays committed WAL batches on top of it.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> KvResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");
        let data_dir = path.join("data");

        std::fs::create_dir_all(&data_dir)
            .map_err(|e| KvError::io_at(&data_dir, e, "Failed to create data directory"))?;
        remove_stale_temp_files(&data_dir);

        let data = Self::load(&path)?;
        let wal = WalWriter::new(&wal_dir, config.wal_rotation_size_bytes)?;

        Ok(Self {
            data: RwLock::new(data),
            pending: Mutex::new(HashMap::new()),
            wal: Some(Mutex::new(wal)),
            path,
            config,
        })
    }

    /// Open a table without write access. Creates no file; a missing table opens empty.
    pub fn open_read_only<P: AsRef<Path>>(path: P, config: Config) -> KvResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = Self::load(&path)?;
        Ok(Self {
            data: RwLock::new(data),
            pending: Mutex::new(HashMap::new()),
            wal: None,
            path,
            config,
        })
    }

    fn load(path: &Path) -> KvResult<HashMap<String, String>> {
        let mut data = HashMap::new();

        if let Some((_, snapshot)) = list_snapshots(&path.join("data"))?.pop() {
            for entry in SnapshotReader::scan_all(&snapshot)? {
                let key = into_string(entry.key, &snapshot, "key")?;
                let value = into_string(entry.value, &snapshot, "value")?;
                data.insert(key, value);
            }
            debug!(snapshot = %snapshot.display(), entries = data.len(), "loaded snapshot");
        }

        let wal_dir = path.join("wal");
        let log = WalReader::new(&wal_dir).recover_committed()?;
        for entry in log.entries {
            let key = into_string(entry.key, &wal_dir, "key")?;
            match entry.operation {
                Operation::Put => {
                    data.insert(key, into_string(entry.value, &wal_dir, "value")?);
                }
                Operation::Delete => {
                    data.remove(&key);
                }
                Operation::Commit => {}
            }
        }
        if log.batches > 0 {
            info!(
                table = %path.display(),
                batches = log.batches,
                discarded = log.discarded,
                "replayed WAL"
            );
        }
        Ok(data)
    }

    fn ensure_writable(&self) -> KvResult<()> {
        if self.wal.is_none() {
            return Err(KvError::ReadOnly { path: self.path.clone() });
        }
        Ok(())
    }

    /// Get the value for `key`, uncommitted writes included.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(staged) = self.pending.lock().get(key) {
            return staged.clone();
        }
        self.data.read().get(key).cloned()
    }

    /// Stage an insert or overwrite.
    pub fn put(&self, key: &str, value: &str) -> KvResult<()> {
        self.ensure_writable()?;
        check_sizes(key.as_bytes(), value.as_bytes(), self.config.max_key_size, self.config.max_value_size)?;
        self.pending.lock().insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    /// Stage a removal. Removing an absent key is a no-op at commit.
    pub fn remove(&self, key: &str) -> KvResult<()> {
        self.ensure_writable()?;
        self.pending.lock().insert(key.to_string(), None);
        Ok(())
    }

    /// Stage the removal of every key.
    pub fn clear(&self) -> KvResult<()> {
        self.ensure_writable()?;
        let keys: Vec<String> = self.data.read().keys().cloned().collect();
        let mut pending = self.pending.lock();
        pending.clear();
        for key in keys {
            pending.insert(key, None);
        }
        Ok(())
    }

    /// Check if `key` is visible.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Visible entries whose key starts with `prefix`, sorted by key.
    ///
    /// Keys are returned whole, prefix included.
    pub fn prefix_scan(&self, prefix: &str) -> Vec<(String, String)> {
        let pending = self.pending.lock();
        let data = self.data.read();

        let mut results: Vec<(String, String)> = data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix) && !pending.contains_key(k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        results.extend(
            pending
                .iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone()))),
        );
        results.sort_by(|(a, _), (b, _)| a.cmp(b));
        results
    }

    /// Visible keys starting with `prefix`, sorted.
    pub fn prefix_keys(&self, prefix: &str) -> Vec<String> {
        let pending = self.pending.lock();
        let data = self.data.read();

        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix) && !pending.contains_key(k.as_str()))
            .cloned()
            .collect();
        keys.extend(
            pending
                .iter()
                .filter(|(k, v)| k.starts_with(prefix) && v.is_some())
                .map(|(k, _)| k.clone()),
        );
        keys.sort();
        keys
    }

    /// All visible keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.prefix_keys("")
    }

    /// All visible values, in key order.
    pub fn values(&self) -> Vec<String> {
        self.prefix_scan("").into_iter().map(|(_, v)| v).collect()
    }

    /// Number of visible entries.
    pub fn len(&self) -> usize {
        let pending = self.pending.lock();
        let data = self.data.read();
        let mut len = data.len();
        for (key, staged) in pending.iter() {
            match (data.contains_key(key.as_str()), staged.is_some()) {
                (false, true) => len += 1,
                (true, false) => len -= 1,
                _ => {}
            }
        }
        len
    }

    /// Returns true if no entry is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether uncommitted writes exist.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Make staged writes durable and visible to later opens.
    ///
    /// WRITE ORDERING:
    /// 1. One WAL batch with a Commit marker (durable_sync if `durable_commit`)
    /// 2. Apply to the committed map
    /// 3. Clear the overlay
    ///
    /// If the WAL write fails, the overlay is kept so the caller may retry or roll back.
    /// Returns the number of operations committed.
    pub fn commit(&self) -> KvResult<usize> {
        let Some(wal) = &self.wal else {
            return Err(KvError::ReadOnly { path: self.path.clone() });
        };
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut batch: Vec<(&String, &Option<String>)> = pending.iter().collect();
        batch.sort_by(|(a, _), (b, _)| a.cmp(b));
        let ops = batch.iter().map(|(k, v)| match v {
            Some(v) => (Operation::Put, k.as_bytes(), v.as_bytes()),
            None => (Operation::Delete, k.as_bytes(), &[][..]),
        });
        let count = wal.lock().append_batch(ops, self.config.durable_commit)?;

        {
            let mut data = self.data.write();
            for (key, staged) in pending.drain() {
                match staged {
                    Some(value) => {
                        data.insert(key, value);
                    }
                    None => {
                        data.remove(&key);
                    }
                }
            }
        }
        debug!(table = %self.path.display(), count, "committed");
        Ok(count)
    }

    /// Discard staged writes. Returns how many were dropped.
    pub fn rollback(&self) -> usize {
        let mut pending = self.pending.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    /// Checkpoint committed state into a snapshot and reset the WAL.
    ///
    /// Staged writes are left untouched.
    pub fn compact(&self) -> KvResult<CheckpointResult> {
        let Some(wal) = &self.wal else {
            return Err(KvError::ReadOnly { path: self.path.clone() });
        };
        let mut wal = wal.lock();
        let data = self.data.read();
        let mut entries: Vec<(&String, &String)> = data.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        checkpoint(
            &self.path.join("data"),
            entries.into_iter().map(|(k, v)| (k.as_bytes(), v.as_bytes())),
            &mut wal,
        )
    }

    /// Checkpoint only if the WAL is mostly dead weight.
    pub fn maybe_compact(&self) -> KvResult<Option<CheckpointResult>> {
        let Some(wal) = &self.wal else { return Ok(None) };
        let wal_bytes = wal.lock().current_size();
        let live_bytes: u64 = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (HEADER_SIZE + 8 + k.len() + v.len()) as u64)
            .sum();

        if needs_checkpoint(wal_bytes, live_bytes, self.config.compaction_trigger_ratio) {
            self.compact().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Sync the WAL and release the table. Staged writes are discarded.
    pub fn close(self) -> KvResult<()> {
        let dropped = self.rollback();
        if dropped > 0 {
            warn!(table = %self.path.display(), dropped, "closing table with uncommitted writes");
        }
        match &self.wal {
            Some(wal) => wal.lock().sync(),
            None => Ok(()),
        }
    }

    /// Table directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether writes are rejected.
    pub fn is_read_only(&self) -> bool {
        self.wal.is_none()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
