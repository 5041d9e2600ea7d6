//! Filesystem-backed race record store.
//!
//! Layout:
//! - `<root>/races/<race_id>.json`: one pretty-printed `StoredRecord` per race,
//!   written once through a temp file and a no-clobber rename
//! - `<root>/index.jsonl`: one `RecordMeta` line per appended race
//!
//! Both files are plain JSON so histories can be diffed and grepped.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::*;

const RACES_DIR: &str = "races";
const INDEX_FILE: &str = "index.jsonl";

/// Append-only race record store rooted at a directory.
pub struct FsRaceRecordStore {
    root: PathBuf,
    races_dir: PathBuf,
    index_lock: Mutex<()>,
}

impl FsRaceRecordStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let races_dir = root.join(RACES_DIR);
        fs::create_dir_all(&races_dir)?;
        Ok(Self {
            root,
            races_dir,
            index_lock: Mutex::new(()),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record file for a race id.
    pub fn record_path(&self, race_id: &RaceRecordId) -> StorageResult<PathBuf> {
        validate_race_id(race_id)?;
        Ok(self.races_dir.join(format!("{}.json", race_id.0)))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn append_index(&self, meta: &RecordMeta) -> StorageResult<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut line = serde_json::to_string(meta)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.index_path())?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

fn validate_race_id(race_id: &RaceRecordId) -> StorageResult<()> {
    let ok = !race_id.0.is_empty()
        && race_id
            .0
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidRaceId {
            race_id: race_id.0.clone(),
        })
    }
}

#[async_trait]
impl RaceRecordStore for FsRaceRecordStore {
    async fn append(
        &self,
        meta: RecordMeta,
        body: serde_json::Value,
    ) -> StorageResult<StoredRecord> {
        let path = self.record_path(&meta.race_id)?;
        if path.exists() {
            return Err(StorageError::AlreadyExists {
                race_id: meta.race_id.0.clone(),
            });
        }

        let record = StoredRecord::seal(meta, body)?;
        let json = serde_json::to_vec_pretty(&record)?;

        let mut tmp = NamedTempFile::new_in(&self.races_dir)?;
        tmp.write_all(&json)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&path).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                StorageError::AlreadyExists {
                    race_id: record.meta.race_id.0.clone(),
                }
            } else {
                StorageError::Io(e.error)
            }
        })?;

        self.append_index(&record.meta)?;
        debug!(race_id = %record.meta.race_id, digest = %record.digest.short(), "race record written");
        Ok(record)
    }

    async fn get(&self, race_id: &RaceRecordId) -> StorageResult<StoredRecord> {
        let path = self.record_path(race_id)?;
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    race_id: race_id.0.clone(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        let record: StoredRecord =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        record.verify()?;
        Ok(record)
    }

    async fn list(&self, scenario_id: Option<&str>) -> StorageResult<Vec<RecordMeta>> {
        let content = match fs::read_to_string(self.index_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut out = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RecordMeta>(line) {
                Ok(meta) => {
                    if scenario_id.map_or(true, |s| meta.scenario_id == s) {
                        out.push(meta);
                    }
                }
                Err(e) => warn!(line = lineno + 1, error = %e, "skipping malformed index line"),
            }
        }
        Ok(out)
    }
}
