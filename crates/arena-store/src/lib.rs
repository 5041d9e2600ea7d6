//! Arena-Store: persistence for finalized race records
//!
//! Every completed race produces exactly one immutable record. This crate
//! owns how those records are written, read back, and listed:
//!
//! - `RaceRecordStore`: the async storage contract (append / get / list)
//! - `FsRaceRecordStore`: one pretty JSON file per race plus an append-only index
//! - `MemoryRaceRecordStore`: in-memory fake for tests
//!
//! Record bodies are opaque JSON here; the race engine owns their schema.

mod error;
pub mod fakes;
mod fs_store;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_store::FsRaceRecordStore;
pub use storage_traits::{
    ContentDigest, RaceRecordId, RaceRecordStore, RecordMeta, StorageResult, StoredRecord,
};
