//! Error types for arena-store

use thiserror::Error;

/// Errors produced by race record stores.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record exists for the race id
    #[error("race record not found: {race_id}")]
    NotFound { race_id: String },

    /// Records are write-once; a second append for the same race is refused
    #[error("race record already exists: {race_id}")]
    AlreadyExists { race_id: String },

    /// Stored body does not hash to the recorded digest
    #[error("digest mismatch for race {race_id}: expected {expected}, got {actual}")]
    DigestMismatch {
        race_id: String,
        expected: String,
        actual: String,
    },

    /// Race id cannot be used as a file name
    #[error("invalid race id: {race_id:?}")]
    InvalidRaceId { race_id: String },

    /// Digest string is not 64 lowercase hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// A file on disk could not be interpreted as a stored record
    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: String, reason: String },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_mismatch_mentions_both_digests() {
        let err = StorageError::DigestMismatch {
            race_id: "r1".to_string(),
            expected: "aaa".to_string(),
            actual: "bbb".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("r1"));
        assert!(msg.contains("aaa"));
        assert!(msg.contains("bbb"));
    }

    #[test]
    fn already_exists_display() {
        let err = StorageError::AlreadyExists {
            race_id: "r2".to_string(),
        };
        assert_eq!(err.to_string(), "race record already exists: r2");
    }
}
