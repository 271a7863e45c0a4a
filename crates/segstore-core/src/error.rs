//! Error types for SegStore table operations
//!
//! All table errors are represented by the KvError enum, which carries
//! enough context (file, offset, component) to diagnose a damaged table.

use std::path::PathBuf;

use thiserror::Error;

/// SegStore table error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum KvError {
    /// I/O operation failed
    #[error("{}", display_io(.path, .kind, .message))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL file is corrupted and cannot be recovered
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        /// Path to the corrupted WAL file
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error(
        "Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}",
        .path.display()
    )]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Torn write detected (partial write at end of file)
    #[error(
        "Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available",
        .path.display()
    )]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected entry size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Entry size exceeds maximum allowed
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized entry
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// Magic bytes not found at expected location
    #[error(
        "Magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
        .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3]
    )]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// A stored key or value is not valid UTF-8
    #[error("Invalid UTF-8 {component} in {}", .path.display())]
    InvalidUtf8 {
        /// Table or file holding the bad bytes
        path: PathBuf,
        /// "key" or "value"
        component: String,
    },

    /// Write attempted on a table opened read-only
    #[error("Table {} is read-only", .path.display())]
    ReadOnly {
        /// Table directory
        path: PathBuf,
    },

    /// Configuration rejected by `Config::validate`
    #[error("Invalid table configuration: {0}")]
    InvalidConfig(String),
}

fn display_io(path: &Option<PathBuf>, kind: &std::io::ErrorKind, message: &str) -> String {
    match path {
        Some(path) => format!("I/O error in {}: {} ({})", path.display(), message, kind),
        None => format!("I/O error: {} ({})", message, kind),
    }
}

impl KvError {
    /// Wrap an I/O error with the file it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: std::io::Error, message: &str) -> Self {
        KvError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", message, err),
        }
    }
}

/// Convert std::io::Error to KvError::Io
impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for table operations
pub type KvResult<T> = Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KvError::ChecksumMismatch {
            path: PathBuf::from("/tmp/test.wal"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("Checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let kv_err: KvError = io_err.into();

        match kv_err {
            KvError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_at_keeps_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = KvError::io_at("/data/objects_0.db", io_err, "Failed to open WAL file");
        let display = err.to_string();
        assert!(display.contains("/data/objects_0.db"));
        assert!(display.contains("Failed to open WAL file"));
    }

    #[test]
    fn test_read_only_display() {
        let err = KvError::ReadOnly { path: PathBuf::from("/x/objects_-1.db") };
        assert_eq!(err.to_string(), "Table /x/objects_-1.db is read-only");
    }
}
