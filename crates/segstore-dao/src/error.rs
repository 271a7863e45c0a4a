//! Error types for the object-graph layer.
//!
//! Most DAO write paths catch these at the public boundary and log them;
//! only genuinely unrecoverable states reach the caller.

use std::path::PathBuf;

use segstore_core::KvError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaoError {
    /// Failure inside a key-value table
    #[error(transparent)]
    Kv(#[from] KvError),

    /// A record could not be encoded or decoded
    #[error("Serialization failed for {context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// File-system failure outside the tables (config, locks, legacy files)
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The experiment declares no output directory; nothing can be stored
    #[error("No output directory configured for dataset {0}")]
    NoOutputDirectory(String),

    /// The dataset has no experiment descriptor yet
    #[error("No experiment configured for dataset {0}")]
    ExperimentMissing(String),

    /// Every 32-bit sequence of the frame is in use
    #[error("Identifier space exhausted at frame {frame}")]
    IdSpaceExhausted { frame: u32 },

    /// Position name not declared by the experiment
    #[error("Unknown position {0}")]
    UnknownPosition(String),
}

impl DaoError {
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        DaoError::Serialization { context: context.into(), source }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DaoError::Io { path: path.into(), source }
    }
}

pub type DaoResult<T> = Result<T, DaoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_error_is_transparent() {
        let err: DaoError = KvError::ReadOnly { path: PathBuf::from("/d/objects_0.db") }.into();
        assert_eq!(err.to_string(), "Table /d/objects_0.db is read-only");
    }

    #[test]
    fn test_serialization_context() {
        let source = serde_json::from_str::<u32>("not json").unwrap_err();
        let err = DaoError::serialization("object 0000000100000002", source);
        assert!(err.to_string().starts_with("Serialization failed for object 0000000100000002"));
    }
}
