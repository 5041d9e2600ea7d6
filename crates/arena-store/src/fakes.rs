//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryRaceRecordStore` satisfies the `RaceRecordStore` contract without
//! touching the filesystem.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory race record store backed by a `Vec` in append order.
#[derive(Debug, Default)]
pub struct MemoryRaceRecordStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryRaceRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RaceRecordStore for MemoryRaceRecordStore {
    async fn append(
        &self,
        meta: RecordMeta,
        body: serde_json::Value,
    ) -> StorageResult<StoredRecord> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.iter().any(|r| r.meta.race_id == meta.race_id) {
            return Err(StorageError::AlreadyExists {
                race_id: meta.race_id.0.clone(),
            });
        }
        let record = StoredRecord::seal(meta, body)?;
        records.push(record.clone());
        Ok(record)
    }

    async fn get(&self, race_id: &RaceRecordId) -> StorageResult<StoredRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .iter()
            .find(|r| &r.meta.race_id == race_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                race_id: race_id.0.clone(),
            })?;
        record.verify()?;
        Ok(record)
    }

    async fn list(&self, scenario_id: Option<&str>) -> StorageResult<Vec<RecordMeta>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .filter(|r| scenario_id.map_or(true, |s| r.meta.scenario_id == s))
            .map(|r| r.meta.clone())
            .collect())
    }
}
