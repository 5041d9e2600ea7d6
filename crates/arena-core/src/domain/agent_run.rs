//! One agent's participation in a race.
//!
//! An [`AgentRun`] is written by exactly one task (the agent's tracker);
//! everyone else sees cloned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{RaceError, Result};
use super::event::ProgressEvent;
use super::race::Endpoint;
use super::score::ScoreRecord;
use super::timeline::{ActionEntry, ActionLog, MetricSeries, SeriesUpdate};

/// Lifecycle state of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Provisioning,
    Running,
    Finished,
    Failed,
    TimedOut,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Finished | AgentStatus::Failed | AgentStatus::TimedOut
        )
    }

    /// Whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (Provisioning, Running) => true,
            (Provisioning | Running, Finished | Failed | TimedOut) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Provisioning => "provisioning",
            AgentStatus::Running => "running",
            AgentStatus::Finished => "finished",
            AgentStatus::Failed => "failed",
            AgentStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why an agent run reached its terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TerminalCause {
    /// The simulation reported its own terminal condition.
    GoalReached,
    /// The progress counter reached the configured duration.
    ProgressLimit { limit: u32 },
    /// The driver exited cleanly.
    DriverExited,
    /// A fatal line was classified in the driver output.
    FatalOutput { line: String },
    /// The driver exited with a nonzero status or was killed by a signal.
    DriverCrashed { code: Option<i32> },
    SpawnFailed { reason: String },
    StepBudget { steps: u64, max: u64 },
    WallClock { limit_secs: u64 },
    Cancelled,
}

impl TerminalCause {
    /// The status this cause maps to.
    pub fn status(&self) -> AgentStatus {
        match self {
            TerminalCause::GoalReached
            | TerminalCause::ProgressLimit { .. }
            | TerminalCause::DriverExited => AgentStatus::Finished,
            TerminalCause::FatalOutput { .. }
            | TerminalCause::DriverCrashed { .. }
            | TerminalCause::SpawnFailed { .. } => AgentStatus::Failed,
            TerminalCause::StepBudget { .. }
            | TerminalCause::WallClock { .. }
            | TerminalCause::Cancelled => AgentStatus::TimedOut,
        }
    }

    /// Human-readable explanation, carried into the race record.
    pub fn reason(&self) -> String {
        match self {
            TerminalCause::GoalReached => "simulation reported completion".to_string(),
            TerminalCause::ProgressLimit { limit } => {
                format!("progress reached configured duration {limit}")
            }
            TerminalCause::DriverExited => "driver exited cleanly".to_string(),
            TerminalCause::FatalOutput { line } => format!("fatal driver error: {line}"),
            TerminalCause::DriverCrashed { code: Some(code) } => {
                format!("driver exited with status {code}")
            }
            TerminalCause::DriverCrashed { code: None } => {
                "driver terminated by signal".to_string()
            }
            TerminalCause::SpawnFailed { reason } => format!("driver failed to start: {reason}"),
            TerminalCause::StepBudget { steps, max } => {
                format!("step budget exhausted ({steps}/{max})")
            }
            TerminalCause::WallClock { limit_secs } => {
                format!("wall-clock limit of {limit_secs}s exceeded")
            }
            TerminalCause::Cancelled => "race cancelled".to_string(),
        }
    }
}

/// Result of offering a progress event to a run.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The run is already terminal; nothing changed.
    Stale,
    Applied {
        update: SeriesUpdate,
        /// Set when the event itself ends the run.
        finish: Option<TerminalCause>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRun {
    pub name: String,
    pub kind: String,
    pub endpoint: Endpoint,
    /// Position in the race's agent list; the tie-break key.
    pub registration: usize,
    pub pid: Option<u32>,
    pub status: AgentStatus,
    pub progress: u32,
    pub series: MetricSeries,
    pub actions: ActionLog,
    pub steps: u64,
    pub score: Option<ScoreRecord>,
    pub cause: Option<TerminalCause>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub channel_connected: bool,
    pub reconnects: u32,
    /// The event channel came up at least once.
    #[serde(default)]
    pub channel_seen: bool,
}

impl AgentRun {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        endpoint: Endpoint,
        registration: usize,
        action_capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            endpoint,
            registration,
            pid: None,
            status: AgentStatus::Provisioning,
            progress: 0,
            series: MetricSeries::new(),
            actions: ActionLog::with_capacity(action_capacity),
            steps: 0,
            score: None,
            cause: None,
            started_at: None,
            finished_at: None,
            channel_connected: false,
            reconnects: 0,
            channel_seen: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn latest_metric(&self) -> Option<f64> {
        self.series.latest().map(|p| p.value)
    }

    /// Reason string for failed and timed-out runs.
    pub fn reason(&self) -> Option<String> {
        match (self.status, &self.cause) {
            (AgentStatus::Failed | AgentStatus::TimedOut, Some(cause)) => Some(cause.reason()),
            _ => None,
        }
    }

    fn transition(&mut self, next: AgentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RaceError::InvalidTransition {
                agent: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// The driver process is up.
    pub fn mark_running(&mut self, pid: Option<u32>) -> Result<()> {
        self.transition(AgentStatus::Running)?;
        self.pid = pid;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Apply a progress event. `duration` is the race's configured
    /// progress limit.
    pub fn ingest(&mut self, event: &ProgressEvent, duration: u32) -> IngestOutcome {
        if self.is_terminal() {
            return IngestOutcome::Stale;
        }

        let update = self.series.record(event.progress, event.metric);
        self.progress = self.progress.max(event.progress);

        if let Some(description) = &event.action {
            self.actions.push(ActionEntry {
                progress: event.progress,
                description: description.clone(),
                observed_at: Utc::now(),
            });
        }
        if self.score.is_none() {
            self.score = event.score.clone();
        }

        let finish = if event.terminal {
            Some(TerminalCause::GoalReached)
        } else if duration > 0 && self.progress >= duration {
            Some(TerminalCause::ProgressLimit { limit: duration })
        } else {
            None
        };
        IngestOutcome::Applied { update, finish }
    }

    /// Record a driver-issued action. Returns `false` when stale.
    pub fn record_action(&mut self, description: &str, progress: Option<u32>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.steps += 1;
        self.actions.push(ActionEntry {
            progress: progress.unwrap_or(self.progress),
            description: description.to_string(),
            observed_at: Utc::now(),
        });
        true
    }

    /// Adopt an action count reported by the instance. Only ever raises
    /// `steps`; returns `true` when it changed.
    pub fn sync_steps(&mut self, observed: u64) -> bool {
        if self.is_terminal() || observed <= self.steps {
            return false;
        }
        self.steps = observed;
        true
    }

    /// Attach the final score if none has been received yet.
    pub fn set_score(&mut self, score: ScoreRecord) {
        if self.score.is_none() {
            self.score = Some(score);
        }
    }

    /// Move to the terminal status implied by `cause`.
    ///
    /// Returns `Ok(false)` when the run was already terminal; the first
    /// terminal cause always wins.
    pub fn finish(&mut self, cause: TerminalCause) -> Result<bool> {
        if self.is_terminal() {
            return Ok(false);
        }
        self.transition(cause.status())?;
        self.cause = Some(cause);
        self.finished_at = Some(Utc::now());
        self.channel_connected = false;
        Ok(true)
    }

    /// Update event channel connectivity; counts reconnects.
    pub fn set_channel(&mut self, connected: bool) {
        if connected && !self.channel_connected {
            if self.channel_seen {
                self.reconnects += 1;
            }
            self.channel_seen = true;
        }
        self.channel_connected = connected;
    }
}
