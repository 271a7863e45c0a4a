//! Write-Ahead Log implementation for SegStore tables
//!
//! The WAL is the commit log of a table. A commit is written as one buffer:
//! 1. Serialize every pending Put/Delete entry
//! 2. Append a Commit marker carrying the batch length
//! 3. Write the buffer to the WAL file in a single `write_all`
//! 4. durable_sync() when the table is configured for durable commits
//!
//! Recovery only applies batches whose Commit marker was read back intact and
//! whose length matches, so a crash mid-commit loses the whole batch, never half of it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{KvError, KvResult};
use crate::format::{deserialize_entry, serialize_commit, serialize_entry, Operation, WalEntry, HEADER_SIZE, MAGIC_ARRAY};
use crate::platform_durability::{durable_sync, sync_directory};

/// WAL writer handles appending commit batches and ensuring durability.
///
/// Invariant: `append_batch` returns only after the whole batch (and its
/// Commit marker) has been handed to the OS; the table applies the batch to
/// its RAM map after that.
pub struct WalWriter {
    /// Current WAL file handle
    file: File,
    /// Path to current WAL file (for error context)
    path: PathBuf,
    /// Current file size in bytes (tracked to avoid stat calls)
    size: u64,
    /// WAL directory for file rotation
    wal_dir: PathBuf,
    /// Monotonic sequence number for WAL file naming
    sequence: u64,
    /// Rotation threshold in bytes
    rotation_size: u64,
}

fn wal_file_name(sequence: u64) -> String {
    format!("wal-{:016x}.segs", sequence)
}

fn parse_wal_sequence(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("wal-")?.strip_suffix(".segs")?;
    u64::from_str_radix(hex, 16).ok()
}

/// List WAL files in sequence order.
fn list_wal_files(wal_dir: &Path) -> KvResult<Vec<(u64, PathBuf)>> {
    let dir_entries = match std::fs::read_dir(wal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KvError::io_at(wal_dir, e, "Failed to read WAL directory")),
    };

    let mut files = Vec::new();
    for entry in dir_entries {
        let entry = entry.map_err(|e| KvError::io_at(wal_dir, e, "Failed to read directory entry"))?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_wal_sequence) {
            files.push((seq, entry.path()));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

impl WalWriter {
    /// Create a WAL writer in the specified directory.
    /// If WAL files already exist, appends to the highest sequence number.
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> KvResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| KvError::io_at(&wal_dir, e, "Failed to create WAL directory"))?;

        let sequence = list_wal_files(&wal_dir)?.last().map_or(1, |(seq, _)| *seq);
        let path = wal_dir.join(wal_file_name(sequence));
        let (file, size) = Self::open_file(&path)?;

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size })
    }

    fn open_file(path: &Path) -> KvResult<(File, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KvError::io_at(path, e, "Failed to open WAL file"))?;
        let size = file
            .metadata()
            .map_err(|e| KvError::io_at(path, e, "Failed to stat WAL file"))?
            .len();
        Ok((file, size))
    }

    /// Append one committed batch. `durable` adds a durable_sync after the write.
    ///
    /// Entries whose operation is `Delete` ignore their value.
    pub fn append_batch<'a, I>(&mut self, ops: I, durable: bool) -> KvResult<usize>
    where
        I: IntoIterator<Item = (Operation, &'a [u8], &'a [u8])>,
    {
        let mut buffer = Vec::new();
        let mut count = 0u64;
        for (op, key, value) in ops {
            let value = if op == Operation::Delete { &[][..] } else { value };
            buffer.extend_from_slice(&serialize_entry(key, value, op)?);
            count += 1;
        }
        if count == 0 {
            return Ok(0);
        }
        buffer.extend_from_slice(&serialize_commit(count)?);

        // A batch never straddles two files
        if self.size > 0 && self.size + buffer.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file
            .write_all(&buffer)
            .map_err(|e| KvError::io_at(&self.path, e, "WAL write failed"))?;
        if durable {
            self.sync()?;
        }

        self.size += buffer.len() as u64;
        Ok(count as usize)
    }

    /// Rotate to a new WAL file. Syncs current file before switching.
    fn rotate(&mut self) -> KvResult<()> {
        self.sync()?;
        self.sequence += 1;
        let new_path = self.wal_dir.join(wal_file_name(self.sequence));
        let (file, size) = Self::open_file(&new_path)?;
        self.file = file;
        self.path = new_path;
        self.size = size;
        debug!(path = %self.path.display(), "rotated WAL file");
        Ok(())
    }

    /// Drop every WAL file and restart on a fresh one.
    ///
    /// Only valid once the table state has been checkpointed elsewhere.
    pub fn reset(&mut self) -> KvResult<()> {
        self.sync()?;
        let old_files = list_wal_files(&self.wal_dir)?;
        self.sequence = old_files.last().map_or(self.sequence, |(seq, _)| *seq) + 1;
        let new_path = self.wal_dir.join(wal_file_name(self.sequence));
        let (file, size) = Self::open_file(&new_path)?;
        self.file = file;
        self.path = new_path;
        self.size = size;

        for (_, old) in old_files {
            std::fs::remove_file(&old).map_err(|e| KvError::io_at(&old, e, "Failed to remove WAL file"))?;
        }
        sync_directory(&self.wal_dir).map_err(|e| KvError::io_at(&self.wal_dir, e, "Failed to sync WAL directory"))
    }

    /// Get the current WAL file path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Get the current WAL file size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }

    /// Sync the current WAL file to persistent storage without writing any entry.
    pub fn sync(&self) -> KvResult<()> {
        durable_sync(&self.file).map_err(|e| KvError::io_at(&self.path, e, "WAL durable_sync failed"))
    }
}

/// Committed operations recovered from a WAL directory.
#[derive(Debug, Default)]
pub struct RecoveredLog {
    /// Put/Delete entries of intact batches, in commit order
    pub entries: Vec<WalEntry>,
    /// Number of intact batches
    pub batches: usize,
    /// Entries dropped because their batch was damaged or never committed
    pub discarded: usize,
}

/// WAL reader handles recovery by replaying committed batches.
pub struct WalReader {
    wal_dir: PathBuf,
}

/// Batch being assembled during recovery.
#[derive(Default)]
struct PendingBatch {
    entries: Vec<WalEntry>,
    damaged: bool,
}

impl WalReader {
    /// Create a new WAL reader for the specified directory.
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover all committed entries from WAL files in sequence order.
    ///
    /// Per file:
    /// 1. Validate magic bytes; on mismatch resync to the next magic and mark the batch damaged
    /// 2. Stop at a torn write (incomplete entry at EOF) - this is the crash point
    /// 3. On a Commit marker, keep the batch if it is undamaged and its length matches
    ///
    /// A trailing batch without a Commit marker is discarded.
    pub fn recover_committed(&self) -> KvResult<RecoveredLog> {
        let mut log = RecoveredLog::default();
        let mut pending = PendingBatch::default();

        for (_, wal_path) in list_wal_files(&self.wal_dir)? {
            self.recover_from_file(&wal_path, &mut pending, &mut log)?;
        }

        if !pending.entries.is_empty() {
            warn!(
                dir = %self.wal_dir.display(),
                entries = pending.entries.len(),
                "discarding uncommitted WAL tail"
            );
            log.discarded += pending.entries.len();
        }
        Ok(log)
    }

    fn recover_from_file(&self, path: &Path, pending: &mut PendingBatch, log: &mut RecoveredLog) -> KvResult<()> {
        let mut file = File::open(path).map_err(|e| KvError::io_at(path, e, "Failed to open WAL file for recovery"))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| KvError::io_at(path, e, "Failed to read WAL file"))?;

        let mut offset = 0;
        while offset + HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != MAGIC_ARRAY {
                warn!(path = %path.display(), offset, "bad magic in WAL, scanning for next entry");
                pending.damaged = true;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let length = u32::from_le_bytes([
                buffer[offset + 4], buffer[offset + 5],
                buffer[offset + 6], buffer[offset + 7],
            ]) as usize;
            let total_entry_size = HEADER_SIZE + length;

            if offset + total_entry_size > buffer.len() {
                warn!(
                    path = %path.display(),
                    offset,
                    needed = total_entry_size,
                    available = buffer.len() - offset,
                    "torn write in WAL"
                );
                break;
            }

            match deserialize_entry(&buffer[offset..offset + total_entry_size]) {
                Ok(entry) => {
                    offset += total_entry_size;
                    if entry.operation == Operation::Commit {
                        Self::close_batch(path, entry, pending, log);
                    } else {
                        pending.entries.push(entry);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), offset, error = %e, "corrupt WAL entry");
                    pending.damaged = true;
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    fn close_batch(path: &Path, marker: WalEntry, pending: &mut PendingBatch, log: &mut RecoveredLog) {
        let batch = std::mem::take(pending);
        let declared = <[u8; 8]>::try_from(marker.value.as_slice())
            .map(u64::from_le_bytes)
            .ok();
        if batch.damaged || declared != Some(batch.entries.len() as u64) {
            warn!(
                path = %path.display(),
                entries = batch.entries.len(),
                declared = ?declared,
                "discarding damaged WAL batch"
            );
            log.discarded += batch.entries.len();
            return;
        }
        log.batches += 1;
        log.entries.extend(batch.entries);
    }
}

/// Scan forward in buffer to find next occurrence of the magic bytes.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}
