//! The race aggregate: who is competing, under what conditions, and the
//! results appended as each agent settles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::agent_run::AgentRun;
use super::error::{RaceError, Result};
use crate::leaderboard::{build_leaderboard, RaceRecord, RECORD_SCHEMA_VERSION};

/// Network address of one simulation instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// `ws://host:port{path}`
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A participant as registered at race creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    pub kind: String,
    pub endpoint: Endpoint,
    pub registration: usize,
}

/// Race metadata shared by the live race and its final record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceMeta {
    pub race_id: Uuid,
    pub seed: u64,
    pub scenario_id: String,
    pub duration: u32,
    pub created_at: DateTime<Utc>,
    pub agents: Vec<AgentEntry>,
}

/// One orchestration run.
#[derive(Debug, Clone)]
pub struct Race {
    meta: RaceMeta,
    results: Vec<AgentRun>,
    finalized: bool,
}

impl Race {
    pub fn new(seed: u64, scenario_id: impl Into<String>, duration: u32, agents: Vec<AgentEntry>) -> Self {
        Self {
            meta: RaceMeta {
                race_id: Uuid::new_v4(),
                seed,
                scenario_id: scenario_id.into(),
                duration,
                created_at: Utc::now(),
                agents,
            },
            results: Vec::new(),
            finalized: false,
        }
    }

    pub fn meta(&self) -> &RaceMeta {
        &self.meta
    }

    pub fn race_id(&self) -> Uuid {
        self.meta.race_id
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn results(&self) -> &[AgentRun] {
        &self.results
    }

    /// Agents registered but without an appended result.
    pub fn pending(&self) -> Vec<String> {
        self.meta
            .agents
            .iter()
            .filter(|a| !self.results.iter().any(|r| r.name == a.name))
            .map(|a| a.name.clone())
            .collect()
    }

    /// Append one agent's settled run.
    pub fn append_result(&mut self, run: AgentRun) -> Result<()> {
        if self.finalized {
            return Err(RaceError::RaceFinalized(self.meta.race_id));
        }
        if !self.meta.agents.iter().any(|a| a.name == run.name) {
            return Err(RaceError::UnknownAgent(run.name));
        }
        if self.results.iter().any(|r| r.name == run.name) {
            return Err(RaceError::DuplicateResult(run.name));
        }
        self.results.push(run);
        Ok(())
    }

    /// Close the race and produce its immutable record.
    ///
    /// Every registered agent must have a terminal result. After this the
    /// race accepts no more results.
    pub fn finalize(&mut self, cancelled: bool) -> Result<RaceRecord> {
        if self.finalized {
            return Err(RaceError::RaceFinalized(self.meta.race_id));
        }
        let mut pending = self.pending();
        pending.extend(
            self.results
                .iter()
                .filter(|r| !r.is_terminal())
                .map(|r| r.name.clone()),
        );
        if !pending.is_empty() {
            return Err(RaceError::RaceIncomplete {
                race_id: self.meta.race_id,
                pending,
            });
        }
        self.finalized = true;

        self.results.sort_by_key(|r| r.registration);
        let entries = build_leaderboard(&self.results);
        Ok(RaceRecord {
            schema_version: RECORD_SCHEMA_VERSION,
            meta: self.meta.clone(),
            generated_at: Utc::now(),
            cancelled,
            entries,
            runs: self.results.clone(),
        })
    }
}
