//! Snapshot data files for SegStore tables
//!
//! A snapshot holds every live entry of a table at checkpoint time.
//! Each entry has a CRC32C checksum for silent SSD corruption detection (bit rot).
//!
//! File format: DataChunkHeader (24 bytes) + key_bytes + value_bytes, repeated.
//! Files are named `snapshot-{seq:016x}.segs`; the highest sequence is the current one.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{KvError, KvResult};
use crate::format::{check_sizes, MAGIC_ARRAY, MAX_KEY_SIZE, MAX_VALUE_SIZE};
use crate::platform_durability::durable_sync;

/// Data chunk header size in bytes
const DATA_HEADER_SIZE: usize = 24;

/// Data chunk header for on-disk entries.
/// Size: 24 bytes
///
/// Layout:
///   [0..4]   magic:     [u8;4] - "SEGS"
///   [4..6]   key_len:   u16 LE
///   [6..10]  value_len: u32 LE
///   [10..14] checksum:  u32 LE - CRC32C of (key_bytes + value_bytes)
///   [14..24] reserved:  zero
#[derive(Debug, Clone, Copy)]
struct DataChunkHeader {
    magic: [u8; 4],
    key_len: u16,
    value_len: u32,
    checksum: u32,
}

impl DataChunkHeader {
    fn new(key_len: u16, value_len: u32, checksum: u32) -> Self {
        Self { magic: MAGIC_ARRAY, key_len, value_len, checksum }
    }

    fn to_bytes(self) -> [u8; DATA_HEADER_SIZE] {
        let mut buf = [0u8; DATA_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.key_len.to_le_bytes());
        buf[6..10].copy_from_slice(&self.value_len.to_le_bytes());
        buf[10..14].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; DATA_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        Self {
            magic,
            key_len: u16::from_le_bytes([buf[4], buf[5]]),
            value_len: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
            checksum: u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]),
        }
    }

    fn sizes_valid(&self) -> bool {
        self.key_len as usize <= MAX_KEY_SIZE && self.value_len as usize <= MAX_VALUE_SIZE
    }
}

fn entry_checksum(key: &[u8], value: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(key), value)
}

/// A data entry read from a snapshot file.
#[derive(Debug, Clone)]
pub struct DataEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub offset: u64,
}

/// File name of snapshot `sequence`.
pub fn snapshot_file_name(sequence: u64) -> String {
    format!("snapshot-{:016x}.segs", sequence)
}

fn parse_snapshot_sequence(name: &str) -> Option<u64> {
    let hex = name.strip_prefix("snapshot-")?.strip_suffix(".segs")?;
    u64::from_str_radix(hex, 16).ok()
}

/// List snapshot files in sequence order. A missing directory has no snapshots.
pub fn list_snapshots(data_dir: &Path) -> KvResult<Vec<(u64, PathBuf)>> {
    let entries = match std::fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KvError::io_at(data_dir, e, "Failed to read data directory")),
    };

    let mut snapshots: Vec<(u64, PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let seq = entry.file_name().to_str().and_then(parse_snapshot_sequence)?;
            Some((seq, entry.path()))
        })
        .collect();
    snapshots.sort_by_key(|(seq, _)| *seq);
    Ok(snapshots)
}

/// Writes a snapshot with CRC32C-protected entries. Synced once, in `finish`.
pub struct SnapshotWriter {
    out: BufWriter<File>,
    path: PathBuf,
    size: u64,
    entries: usize,
}

impl SnapshotWriter {
    /// Create (or truncate) the snapshot file at `path`.
    pub fn create(path: &Path) -> KvResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| KvError::io_at(path, e, "Failed to create snapshot file"))?;
        Ok(Self { out: BufWriter::new(file), path: path.to_path_buf(), size: 0, entries: 0 })
    }

    /// Append one entry. Returns the byte offset where it was written.
    pub fn write_entry(&mut self, key: &[u8], value: &[u8]) -> KvResult<u64> {
        check_sizes(key, value, MAX_KEY_SIZE, MAX_VALUE_SIZE)?;

        let header = DataChunkHeader::new(key.len() as u16, value.len() as u32, entry_checksum(key, value));
        let offset = self.size;
        for part in [&header.to_bytes()[..], key, value] {
            self.out
                .write_all(part)
                .map_err(|e| KvError::io_at(&self.path, e, "Snapshot write failed"))?;
        }
        self.size += (DATA_HEADER_SIZE + key.len() + value.len()) as u64;
        self.entries += 1;
        Ok(offset)
    }

    /// Number of entries written so far.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Flush and durably sync. Returns the file size in bytes.
    pub fn finish(self) -> KvResult<u64> {
        let path = self.path;
        let file = self
            .out
            .into_inner()
            .map_err(|e| KvError::io_at(&path, e.into_error(), "Snapshot flush failed"))?;
        durable_sync(&file).map_err(|e| KvError::io_at(&path, e, "Snapshot durable_sync failed"))?;
        Ok(self.size)
    }
}

/// Reads entries from snapshot files with CRC32C verification.
pub struct SnapshotReader;

impl SnapshotReader {
    /// Scan all intact entries of a snapshot file.
    ///
    /// Entries with a bad checksum are skipped; a bad header resyncs to the next magic;
    /// a truncated tail ends the scan.
    pub fn scan_all(file_path: &Path) -> KvResult<Vec<DataEntry>> {
        let mut file = File::open(file_path)
            .map_err(|e| KvError::io_at(file_path, e, "Failed to open snapshot for scan"))?;
        let file_len = file.metadata()?.len();
        let mut entries = Vec::new();
        let mut offset = 0u64;

        while offset + DATA_HEADER_SIZE as u64 <= file_len {
            file.seek(SeekFrom::Start(offset))?;

            let mut hdr_buf = [0u8; DATA_HEADER_SIZE];
            if file.read_exact(&mut hdr_buf).is_err() {
                break;
            }
            let hdr = DataChunkHeader::from_bytes(&hdr_buf);

            if hdr.magic != MAGIC_ARRAY || !hdr.sizes_valid() {
                warn!(path = %file_path.display(), offset, "bad snapshot header, resyncing");
                match find_next_magic(&mut file, offset + 1, file_len) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let entry_total = DATA_HEADER_SIZE as u64 + hdr.key_len as u64 + hdr.value_len as u64;
            if offset + entry_total > file_len {
                warn!(path = %file_path.display(), offset, "truncated snapshot entry");
                break;
            }

            let mut key = vec![0u8; hdr.key_len as usize];
            let mut value = vec![0u8; hdr.value_len as usize];
            if file.read_exact(&mut key).is_err() || file.read_exact(&mut value).is_err() {
                break;
            }

            if entry_checksum(&key, &value) == hdr.checksum {
                entries.push(DataEntry { key, value, offset });
            } else {
                warn!(path = %file_path.display(), offset, "snapshot CRC mismatch, skipping entry");
            }

            offset += entry_total;
        }

        Ok(entries)
    }
}

/// Scan forward in file to find next magic bytes (corruption recovery).
fn find_next_magic(file: &mut File, start: u64, file_len: u64) -> Option<u64> {
    let mut buf = [0u8; 4096];
    let mut pos = start;

    while pos + 4 <= file_len {
        file.seek(SeekFrom::Start(pos)).ok()?;
        let n = file.read(&mut buf).ok()?;
        if n < 4 { return None; }

        if let Some(i) = (0..n - 3).find(|&i| buf[i..i + 4] == MAGIC_ARRAY) {
            return Some(pos + i as u64);
        }
        pos += (n - 3) as u64;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_scan() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(snapshot_file_name(1));
        let mut writer = SnapshotWriter::create(&path).unwrap();

        writer.write_entry(b"k1", b"v1").unwrap();
        writer.write_entry(b"k2", b"").unwrap();
        writer.write_entry(b"k3", b"v3").unwrap();
        assert_eq!(writer.entries(), 3);
        writer.finish().unwrap();

        let entries = SnapshotReader::scan_all(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, b"k1");
        assert_eq!(entries[1].value, b"");
        assert_eq!(entries[2].value, b"v3");
    }

    #[test]
    fn test_checksum_mismatch_skips_entry() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(snapshot_file_name(1));
        let mut writer = SnapshotWriter::create(&path).unwrap();
        let first = writer.write_entry(b"key", b"value").unwrap();
        writer.write_entry(b"next", b"fine").unwrap();
        writer.finish().unwrap();

        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(first + DATA_HEADER_SIZE as u64 + 4)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }

        let entries = SnapshotReader::scan_all(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"next");
    }

    #[test]
    fn test_truncated_tail_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(snapshot_file_name(1));
        let mut writer = SnapshotWriter::create(&path).unwrap();
        writer.write_entry(b"whole", b"entry").unwrap();
        writer.write_entry(b"cut", b"in half").unwrap();
        let size = writer.finish().unwrap();

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(size - 3).unwrap();

        let entries = SnapshotReader::scan_all(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"whole");
    }

    #[test]
    fn test_list_snapshots_ordered() {
        let tmp = TempDir::new().unwrap();
        for seq in [3u64, 1, 2] {
            SnapshotWriter::create(&tmp.path().join(snapshot_file_name(seq))).unwrap().finish().unwrap();
        }
        std::fs::write(tmp.path().join("unrelated.txt"), b"x").unwrap();

        let seqs: Vec<u64> = list_snapshots(tmp.path()).unwrap().into_iter().map(|(s, _)| s).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(list_snapshots(&tmp.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SnapshotWriter::create(&tmp.path().join(snapshot_file_name(1))).unwrap();
        let big_key = vec![0xAA; MAX_KEY_SIZE + 1];
        assert!(matches!(writer.write_entry(&big_key, b"v"), Err(KvError::OversizedEntry { .. })));
    }
}
