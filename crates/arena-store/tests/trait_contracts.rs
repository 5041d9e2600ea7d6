//! Trait contract tests for RaceRecordStore.
//!
//! Every conforming implementation must pass these. Each contract runs
//! against the in-memory fake and the filesystem store.

use chrono::{TimeZone, Utc};
use serde_json::json;

use arena_store::fakes::MemoryRaceRecordStore;
use arena_store::storage_traits::*;
use arena_store::{FsRaceRecordStore, StorageError};

fn meta(id: &str, scenario: &str) -> RecordMeta {
    RecordMeta {
        race_id: RaceRecordId::from(id),
        scenario_id: scenario.to_string(),
        seed: 1234,
        duration: 30,
        created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        finalized_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap(),
        agents: vec!["claude".to_string(), "codex".to_string()],
    }
}

fn body() -> serde_json::Value {
    json!({
        "entries": [
            {"rank": 1, "agent": "claude", "value": 1200.5},
            {"rank": 2, "agent": "codex", "value": 800.25}
        ],
        "cancelled": false
    })
}

async fn append_then_get_returns_same_body(store: &dyn RaceRecordStore) {
    let stored = store.append(meta("r-1", "vending"), body()).await.unwrap();
    let fetched = store.get(&RaceRecordId::from("r-1")).await.unwrap();

    assert_eq!(fetched.body, body());
    assert_eq!(fetched.digest, stored.digest);
    assert_eq!(fetched.meta, stored.meta);
}

async fn second_append_is_refused(store: &dyn RaceRecordStore) {
    store.append(meta("r-2", "vending"), body()).await.unwrap();
    let err = store
        .append(meta("r-2", "vending"), json!({"entries": []}))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists { .. }));

    // The original record is untouched.
    let fetched = store.get(&RaceRecordId::from("r-2")).await.unwrap();
    assert_eq!(fetched.body, body());
}

async fn missing_race_is_not_found(store: &dyn RaceRecordStore) {
    let err = store.get(&RaceRecordId::from("nope")).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound { .. }));
}

async fn list_is_append_ordered_and_filterable(store: &dyn RaceRecordStore) {
    store.append(meta("r-a", "vending"), body()).await.unwrap();
    store.append(meta("r-b", "ethics"), body()).await.unwrap();
    store.append(meta("r-c", "vending"), body()).await.unwrap();

    let all: Vec<String> = store
        .list(None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.race_id.0)
        .collect();
    assert_eq!(all, vec!["r-a", "r-b", "r-c"]);

    let vending: Vec<String> = store
        .list(Some("vending"))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.race_id.0)
        .collect();
    assert_eq!(vending, vec!["r-a", "r-c"]);
}

async fn empty_store_lists_nothing(store: &dyn RaceRecordStore) {
    assert!(store.list(None).await.unwrap().is_empty());
}

// ===========================================================================
// MemoryRaceRecordStore
// ===========================================================================

#[tokio::test]
async fn memory_append_then_get() {
    append_then_get_returns_same_body(&MemoryRaceRecordStore::new()).await;
}

#[tokio::test]
async fn memory_second_append_refused() {
    second_append_is_refused(&MemoryRaceRecordStore::new()).await;
}

#[tokio::test]
async fn memory_missing_race() {
    missing_race_is_not_found(&MemoryRaceRecordStore::new()).await;
}

#[tokio::test]
async fn memory_list_order() {
    list_is_append_ordered_and_filterable(&MemoryRaceRecordStore::new()).await;
}

#[tokio::test]
async fn memory_empty_list() {
    empty_store_lists_nothing(&MemoryRaceRecordStore::new()).await;
}

// ===========================================================================
// FsRaceRecordStore
// ===========================================================================

fn fs_store() -> (tempfile::TempDir, FsRaceRecordStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = FsRaceRecordStore::open(dir.path()).unwrap();
    (dir, store)
}

#[tokio::test]
async fn fs_append_then_get() {
    let (_dir, store) = fs_store();
    append_then_get_returns_same_body(&store).await;
}

#[tokio::test]
async fn fs_second_append_refused() {
    let (_dir, store) = fs_store();
    second_append_is_refused(&store).await;
}

#[tokio::test]
async fn fs_missing_race() {
    let (_dir, store) = fs_store();
    missing_race_is_not_found(&store).await;
}

#[tokio::test]
async fn fs_list_order() {
    let (_dir, store) = fs_store();
    list_is_append_ordered_and_filterable(&store).await;
}

#[tokio::test]
async fn fs_empty_list() {
    let (_dir, store) = fs_store();
    empty_store_lists_nothing(&store).await;
}

#[tokio::test]
async fn fs_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FsRaceRecordStore::open(dir.path()).unwrap();
        store.append(meta("r-keep", "vending"), body()).await.unwrap();
    }
    let reopened = FsRaceRecordStore::open(dir.path()).unwrap();
    let fetched = reopened.get(&RaceRecordId::from("r-keep")).await.unwrap();
    assert_eq!(fetched.body, body());
    assert_eq!(reopened.list(None).await.unwrap().len(), 1);
}
