//! Race history: finalized records in a [`RaceRecordStore`].
//!
//! The store treats bodies as opaque JSON. This module owns the mapping
//! between a [`RaceRecord`] and its stored envelope.

use std::sync::Arc;

use arena_store::{ContentDigest, RaceRecordId, RaceRecordStore, RecordMeta, StoredRecord};
use tracing::info;

use crate::domain::Result;
use crate::leaderboard::RaceRecord;

#[derive(Clone)]
pub struct RaceHistory {
    store: Arc<dyn RaceRecordStore>,
}

fn header(record: &RaceRecord) -> RecordMeta {
    let meta = &record.meta;
    RecordMeta {
        race_id: RaceRecordId(meta.race_id.to_string()),
        scenario_id: meta.scenario_id.clone(),
        seed: meta.seed,
        duration: meta.duration,
        created_at: meta.created_at,
        finalized_at: record.generated_at,
        agents: meta.agents.iter().map(|a| a.name.clone()).collect(),
    }
}

impl RaceHistory {
    pub fn new(store: Arc<dyn RaceRecordStore>) -> Self {
        Self { store }
    }

    /// Store a finalized record. A race can be persisted once.
    pub async fn persist(&self, record: &RaceRecord) -> Result<StoredRecord> {
        let body = serde_json::to_value(record)?;
        let stored = self.store.append(header(record), body).await?;
        info!(
            race_id = %stored.meta.race_id,
            digest = %stored.digest.short(),
            "race record persisted"
        );
        Ok(stored)
    }

    pub async fn load(&self, race_id: &str) -> Result<RaceRecord> {
        let stored = self.store.get(&RaceRecordId::from(race_id)).await?;
        Ok(serde_json::from_value(stored.body)?)
    }

    /// Headers oldest first, optionally for one scenario.
    pub async fn list(&self, scenario_id: Option<&str>) -> Result<Vec<RecordMeta>> {
        Ok(self.store.list(scenario_id).await?)
    }

    /// Re-check a stored record's digest and return it.
    pub async fn verify(&self, race_id: &str) -> Result<ContentDigest> {
        let stored = self.store.get(&RaceRecordId::from(race_id)).await?;
        stored.verify()?;
        Ok(stored.digest)
    }
}

impl std::fmt::Debug for RaceHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceHistory").finish_non_exhaustive()
    }
}
