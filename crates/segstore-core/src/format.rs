//! Binary format definitions for SegStore WAL entries
//!
//! All WAL entries follow a consistent format:
//! ChunkHeader (32 bytes) + key_len(u16) + value_len(u32) + operation(u8) + padding(u8) + key_bytes + value_bytes
//!
//! A transaction is a run of Put/Delete entries closed by a Commit entry
//! (empty key, value = little-endian u64 batch length).

use std::path::PathBuf;

use crate::error::{KvError, KvResult};

/// Magic bytes identifying SegStore chunks: "SEGS" in ASCII
pub const MAGIC_ARRAY: [u8; 4] = [0x53, 0x45, 0x47, 0x53];

/// Maximum key size in bytes
pub const MAX_KEY_SIZE: usize = 128;

/// Maximum value size in bytes (32MB)
pub const MAX_VALUE_SIZE: usize = 32 * 1024 * 1024;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// WAL operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or update a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
    /// Close the current batch
    Commit = 3,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            3 => Some(Operation::Commit),
            _ => None,
        }
    }
}

/// 32-byte header in front of every WAL entry.
///
/// ```text
/// [0..4]   magic      "SEGS"
/// [4..8]   length     u32 LE, payload bytes
/// [8..12]  checksum   u32 LE, CRC32C of the payload
/// [12]     entry_type Operation as u8
/// [13..32] reserved   zero
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub entry_type: u8,
}

/// Complete WAL entry structure (deserialized)
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub header: ChunkHeader,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub operation: Operation,
}

impl ChunkHeader {
    pub fn new(length: u32, checksum: u32, entry_type: Operation) -> Self {
        Self { magic: MAGIC_ARRAY, length, checksum, entry_type: entry_type as u8 }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.entry_type;
        buf
    }

    /// Decode without validation; callers check magic and checksum.
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            length: word(4),
            checksum: word(8),
            entry_type: bytes[12],
        }
    }
}

/// Reject keys and values beyond the hard format limits.
pub fn check_sizes(key: &[u8], value: &[u8], max_key: usize, max_value: usize) -> KvResult<()> {
    if key.len() > max_key {
        return Err(KvError::OversizedEntry {
            entry_size: key.len() as u64,
            max_size: max_key as u64,
            component: "key".to_string(),
        });
    }
    if value.len() > max_value {
        return Err(KvError::OversizedEntry {
            entry_size: value.len() as u64,
            max_size: max_value as u64,
            component: "value".to_string(),
        });
    }
    Ok(())
}

/// Serialize a key-value pair into a complete WAL entry
pub fn serialize_entry(key: &[u8], value: &[u8], op: Operation) -> KvResult<Vec<u8>> {
    check_sizes(key, value, MAX_KEY_SIZE, MAX_VALUE_SIZE)?;

    // Payload: key_len(2) + value_len(4) + operation(1) + padding(1) + key + value
    let payload_size = 2 + 4 + 1 + 1 + key.len() + value.len();

    let mut payload = Vec::with_capacity(payload_size);
    payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
    payload.push(op as u8);
    payload.push(0);
    payload.extend_from_slice(key);
    payload.extend_from_slice(value);

    let checksum = crc32c::crc32c(&payload);
    let header = ChunkHeader::new(payload.len() as u32, checksum, op);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_size);
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(&payload);
    Ok(buffer)
}

/// Commit marker closing a batch of `batch_len` entries.
pub fn serialize_commit(batch_len: u64) -> KvResult<Vec<u8>> {
    serialize_entry(&[], &batch_len.to_le_bytes(), Operation::Commit)
}

fn corrupted(offset: u64, reason: String) -> KvError {
    KvError::WalCorrupted { path: PathBuf::from("<buffer>"), offset, reason }
}

/// Deserialize a WAL entry from a byte slice
pub fn deserialize_entry(data: &[u8]) -> KvResult<WalEntry> {
    if data.len() < HEADER_SIZE {
        return Err(corrupted(0, format!("Entry too short: {} bytes, need at least {}", data.len(), HEADER_SIZE)));
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = ChunkHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(KvError::NoMagicFound {
            path: PathBuf::from("<buffer>"),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_start = HEADER_SIZE;
    let payload_end = payload_start + header.length as usize;
    if data.len() < payload_end {
        return Err(KvError::TornWrite {
            path: PathBuf::from("<buffer>"),
            expected_size: header.length,
            available_bytes: (data.len() - payload_start) as u64,
            offset: payload_start as u64,
        });
    }

    let payload = &data[payload_start..payload_end];
    let computed_checksum = crc32c::crc32c(payload);
    if computed_checksum != header.checksum {
        return Err(KvError::ChecksumMismatch {
            path: PathBuf::from("<buffer>"),
            expected: header.checksum,
            actual: computed_checksum,
            offset: payload_start as u64,
        });
    }

    if payload.len() < 8 {
        return Err(corrupted(payload_start as u64, "Payload too short for header fields".to_string()));
    }

    let key_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let value_len = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]) as usize;
    let operation = Operation::from_byte(payload[6]).ok_or_else(|| {
        corrupted((payload_start + 6) as u64, format!("Invalid operation type: {}", payload[6]))
    })?;
    if operation as u8 != header.entry_type {
        return Err(corrupted(12, format!(
            "Header operation {} disagrees with payload operation {}",
            header.entry_type, operation as u8
        )));
    }

    let data_start = 8;
    let key_end = data_start + key_len;
    let value_end = key_end + value_len;
    if payload.len() < value_end {
        return Err(corrupted(payload_start as u64, format!(
            "Payload too short: need {} bytes for key({}) + value({})",
            value_end, key_len, value_len
        )));
    }

    Ok(WalEntry {
        header,
        key: payload[data_start..key_end].to_vec(),
        value: payload[key_end..value_end].to_vec(),
        operation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes() {
        let header = ChunkHeader::new(7, 0xDEAD_BEEF, Operation::Delete);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], b"SEGS");
        assert!(bytes[13..].iter().all(|&b| b == 0));
        assert_eq!(ChunkHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn test_put_entry_decodes() {
        let serialized = serialize_entry(b"root/0000000000000001", b"{\"id\":1}", Operation::Put).unwrap();
        let entry = deserialize_entry(&serialized).unwrap();

        assert_eq!(entry.key, b"root/0000000000000001");
        assert_eq!(entry.value, b"{\"id\":1}");
        assert_eq!(entry.operation, Operation::Put);
        assert_eq!(entry.header.magic, MAGIC_ARRAY);
    }

    #[test]
    fn test_commit_marker_carries_batch_len() {
        let serialized = serialize_commit(42).unwrap();
        let entry = deserialize_entry(&serialized).unwrap();
        assert_eq!(entry.operation, Operation::Commit);
        assert!(entry.key.is_empty());
        assert_eq!(u64::from_le_bytes(entry.value.as_slice().try_into().unwrap()), 42);
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = vec![0u8; MAX_KEY_SIZE + 1];
        let result = serialize_entry(&key, b"val", Operation::Put);
        assert!(matches!(result, Err(KvError::OversizedEntry { component, .. }) if component == "key"));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = serialize_entry(b"key", b"value", Operation::Put).unwrap();
        data[0] = 0xFF;
        assert!(matches!(deserialize_entry(&data), Err(KvError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = serialize_entry(b"key", b"value", Operation::Put).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(deserialize_entry(&data), Err(KvError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_entry_is_torn() {
        let data = serialize_entry(b"key", b"value", Operation::Delete).unwrap();
        let short = &data[..data.len() - 2];
        assert!(matches!(deserialize_entry(short), Err(KvError::TornWrite { .. })));
    }
}
