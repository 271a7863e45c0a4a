//! Checkpointing: folding the WAL into a snapshot
//!
//! A table's WAL grows with every commit, including overwrites and deletes.
//! A checkpoint writes the live map to a new snapshot, then drops the WAL.
//!
//! Checkpoints use the atomic rename pattern for crash safety:
//! 1. Write the snapshot to a temp file (snapshot-{seq}.segs.tmp)
//! 2. durable_sync the temp file
//! 3. Rename it to its final name (atomic on POSIX)
//! 4. Sync the data directory
//! 5. Remove older snapshots and reset the WAL
//!
//! A crash before step 3 leaves the previous snapshot and the WAL intact.
//! A crash after step 3 leaves the new snapshot plus a WAL that replays
//! idempotently on top of it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::datafile::{list_snapshots, snapshot_file_name, SnapshotWriter};
use crate::error::{KvError, KvResult};
use crate::platform_durability::sync_directory;
use crate::wal::WalWriter;

/// Result of a checkpoint.
#[derive(Debug)]
pub struct CheckpointResult {
    /// The snapshot now holding the table
    pub snapshot_path: PathBuf,
    /// Entries written to the snapshot
    pub live_entries: usize,
    /// Snapshot size in bytes
    pub snapshot_bytes: u64,
    /// WAL bytes dropped by the reset
    pub wal_bytes_reclaimed: u64,
    /// Older snapshots deleted
    pub removed_snapshots: usize,
}

/// Write `entries` as snapshot `sequence` in `data_dir` via temp file and rename.
pub fn write_snapshot<'a, I>(data_dir: &Path, sequence: u64, entries: I) -> KvResult<(PathBuf, usize, u64)>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    fs::create_dir_all(data_dir).map_err(|e| KvError::io_at(data_dir, e, "Failed to create data directory"))?;

    let final_path = data_dir.join(snapshot_file_name(sequence));
    let tmp_path = final_path.with_extension("segs.tmp");

    let mut writer = SnapshotWriter::create(&tmp_path)?;
    for (key, value) in entries {
        writer.write_entry(key, value)?;
    }
    let count = writer.entries();
    let bytes = writer.finish()?;

    fs::rename(&tmp_path, &final_path)
        .map_err(|e| KvError::io_at(&final_path, e, "Failed to rename snapshot"))?;
    sync_directory(data_dir).map_err(|e| KvError::io_at(data_dir, e, "Failed to sync data directory"))?;

    Ok((final_path, count, bytes))
}

/// Checkpoint a table: snapshot its live entries, delete older snapshots, reset its WAL.
pub fn checkpoint<'a, I>(data_dir: &Path, entries: I, wal: &mut WalWriter) -> KvResult<CheckpointResult>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let previous = list_snapshots(data_dir)?;
    let sequence = previous.last().map_or(1, |(seq, _)| seq + 1);
    let wal_bytes_reclaimed = wal.current_size();

    let (snapshot_path, live_entries, snapshot_bytes) = write_snapshot(data_dir, sequence, entries)?;

    let mut removed_snapshots = 0;
    for (_, old) in &previous {
        fs::remove_file(old).map_err(|e| KvError::io_at(old, e, "Failed to remove old snapshot"))?;
        removed_snapshots += 1;
    }
    if removed_snapshots > 0 {
        sync_directory(data_dir).map_err(|e| KvError::io_at(data_dir, e, "Failed to sync data directory"))?;
    }

    wal.reset()?;

    info!(
        snapshot = %snapshot_path.display(),
        live_entries,
        wal_bytes_reclaimed,
        "checkpoint complete"
    );

    Ok(CheckpointResult { snapshot_path, live_entries, snapshot_bytes, wal_bytes_reclaimed, removed_snapshots })
}

/// Whether the WAL carries enough dead weight to be worth folding.
///
/// `live_bytes` estimates the size of the live map; the rest of the WAL is overwrites and deletes.
pub fn needs_checkpoint(wal_bytes: u64, live_bytes: u64, threshold: f64) -> bool {
    if wal_bytes == 0 {
        return false;
    }
    let dead_ratio = 1.0 - (live_bytes.min(wal_bytes) as f64 / wal_bytes as f64);
    dead_ratio >= threshold
}

/// Remove temp files left behind by a checkpoint that crashed before its rename.
pub fn remove_stale_temp_files(data_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(data_dir) else { return 0 };
    let mut removed = 0;
    for entry in entries.flatten() {
        let is_tmp = entry.file_name().to_str().map_or(false, |n| n.ends_with(".segs.tmp"));
        if !is_tmp {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed stale snapshot temp file");
                removed += 1;
            }
            Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot remove stale temp file"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::SnapshotReader;
    use crate::format::Operation;
    use crate::wal::WalReader;
    use tempfile::TempDir;

    #[test]
    fn test_write_snapshot_is_renamed() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let pairs: Vec<(&[u8], &[u8])> = vec![(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..])];

        let (path, count, bytes) = write_snapshot(&data_dir, 7, pairs).unwrap();
        assert_eq!(count, 2);
        assert!(bytes > 0);
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), snapshot_file_name(7));
        assert!(!path.with_extension("segs.tmp").exists());
        assert_eq!(SnapshotReader::scan_all(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoint_replaces_snapshot_and_resets_wal() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let wal_dir = tmp.path().join("wal");
        let mut wal = WalWriter::new(&wal_dir, 1024 * 1024).unwrap();
        wal.append_batch(vec![(Operation::Put, &b"k"[..], &b"v"[..])], true).unwrap();

        let first: Vec<(&[u8], &[u8])> = vec![(&b"old"[..], &b"x"[..])];
        checkpoint(&data_dir, first, &mut wal).unwrap();

        let second: Vec<(&[u8], &[u8])> = vec![(&b"k"[..], &b"v"[..]), (&b"k2"[..], &b"v2"[..])];
        let result = checkpoint(&data_dir, second, &mut wal).unwrap();

        assert_eq!(result.live_entries, 2);
        assert_eq!(result.removed_snapshots, 1);
        let snapshots = list_snapshots(&data_dir).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].1, result.snapshot_path);

        let log = WalReader::new(&wal_dir).recover_committed().unwrap();
        assert!(log.entries.is_empty());
    }

    #[test]
    fn test_needs_checkpoint_threshold() {
        assert!(!needs_checkpoint(0, 0, 0.5));
        // 60% dead
        assert!(needs_checkpoint(1000, 400, 0.5));
        // 20% dead
        assert!(!needs_checkpoint(1000, 800, 0.5));
        // live estimate above WAL size counts as no waste
        assert!(!needs_checkpoint(100, 500, 0.1));
    }

    #[test]
    fn test_remove_stale_temp_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("snapshot-0000000000000002.segs.tmp"), b"partial").unwrap();
        fs::write(tmp.path().join(snapshot_file_name(1)), b"").unwrap();

        assert_eq!(remove_stale_temp_files(tmp.path()), 1);
        assert!(tmp.path().join(snapshot_file_name(1)).exists());
        assert_eq!(remove_stale_temp_files(&tmp.path().join("missing")), 0);
    }
}
