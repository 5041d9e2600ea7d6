//! Storage trait definitions for arena-store
//!
//! - `ContentDigest`: SHA-256 identity of a stored record body
//! - `RaceRecordStore`: append-only persistence of finalized race records
//!
//! The trait is async and backend-agnostic. An in-memory fake lives in the
//! `fakes` module; the filesystem backend lives in `fs_store`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always valid lowercase hex
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of the compact JSON encoding of `body`.
    ///
    /// `serde_json::Value` objects keep their keys sorted, so equal values
    /// always produce equal digests regardless of how they were written.
    pub fn of_json(body: &serde_json::Value) -> StorageResult<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(d: ContentDigest) -> Self {
        d.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RaceRecordStore
// ---------------------------------------------------------------------------

/// Identifier of a stored race record (the race's UUID in string form)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RaceRecordId(pub String);

impl std::fmt::Display for RaceRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RaceRecordId {
    fn from(s: &str) -> Self {
        RaceRecordId(s.to_string())
    }
}

/// Searchable header of a stored race, kept next to the opaque body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub race_id: RaceRecordId,
    pub scenario_id: String,
    pub seed: u64,
    /// Configured duration in scenario units (e.g. simulated days)
    pub duration: u32,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    /// Participating agent names in registration order
    pub agents: Vec<String>,
}

/// A record as it sits in a store: header, body, and the body's digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub meta: RecordMeta,
    pub digest: ContentDigest,
    pub body: serde_json::Value,
}

impl StoredRecord {
    /// Build a stored record, computing the digest of `body`.
    pub fn seal(meta: RecordMeta, body: serde_json::Value) -> StorageResult<Self> {
        let digest = ContentDigest::of_json(&body)?;
        Ok(Self { meta, digest, body })
    }

    /// Recompute the body digest and compare it to the stored one.
    pub fn verify(&self) -> StorageResult<()> {
        let actual = ContentDigest::of_json(&self.body)?;
        if actual != self.digest {
            return Err(StorageError::DigestMismatch {
                race_id: self.meta.race_id.0.clone(),
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// Append-only store of finalized race records.
///
/// Guarantees:
/// - A race id is written at most once; later appends fail with
///   `StorageError::AlreadyExists`.
/// - `get` returns exactly the body that was appended, digest-verified.
/// - `list` returns headers oldest first (append order).
#[async_trait]
pub trait RaceRecordStore: Send + Sync {
    /// Persist a new record. Fails if the race id is already present.
    async fn append(&self, meta: RecordMeta, body: serde_json::Value)
        -> StorageResult<StoredRecord>;

    /// Retrieve a record by race id.
    async fn get(&self, race_id: &RaceRecordId) -> StorageResult<StoredRecord>;

    /// List record headers, optionally filtered by scenario id.
    async fn list(&self, scenario_id: Option<&str>) -> StorageResult<Vec<RecordMeta>>;
}
