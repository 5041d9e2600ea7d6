//! Domain models for the race engine.
//!
//! Canonical definitions for the core entities:
//! - `Race`: one orchestration run and its participants
//! - `AgentRun`: one agent's participation, owned by its tracker task
//! - `ProgressEvent`: a transient state update from a simulation
//! - `ScoreRecord`: the resolved terminal evaluation of a run

pub mod agent_run;
pub mod error;
pub mod event;
pub mod race;
pub mod score;
pub mod timeline;

pub use agent_run::{AgentRun, AgentStatus, IngestOutcome, TerminalCause};
pub use error::{RaceError, Result, ScoreError};
pub use event::{ProgressEvent, SignalSource};
pub use race::{AgentEntry, Endpoint, Race, RaceMeta};
pub use score::{DimensionScore, ScoreRecord, ScoreScheme};
pub use timeline::{ActionEntry, ActionLog, MetricPoint, MetricSeries, SeriesUpdate};
