//! Error types for vantage-state

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem I/O failed (open, write, fsync, rename)
    #[error("I/O failed on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Record could not be encoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Persisted record could not be decoded
    #[error("Deserialization failed at {path}:{line}: {reason}")]
    Deserialization {
        path: String,
        line: usize,
        reason: String,
    },

    /// Sink or store refused the write (used by the failing test doubles and
    /// by backends that report a rejected transaction)
    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

impl StorageError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_names_path() {
        let err = StorageError::io(
            std::path::Path::new("/tmp/population.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/tmp/population.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn deserialization_error_names_line() {
        let err = StorageError::Deserialization {
            path: "audit.jsonl".to_string(),
            line: 7,
            reason: "EOF".to_string(),
        };
        assert!(err.to_string().contains("audit.jsonl:7"));
    }
}
