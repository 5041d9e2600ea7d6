//! Transient progress signals produced by a simulation instance.

use serde::{Deserialize, Serialize};

use super::score::ScoreRecord;

/// Which producer delivered a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Event channel push.
    Push,
    /// Fallback state poll.
    Poll,
    /// Final state fetch after the run went terminal.
    Final,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SignalSource::Push => "push",
            SignalSource::Poll => "poll",
            SignalSource::Final => "final",
        })
    }
}

/// One state update for one agent. Consumed immediately by the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub agent: String,
    pub progress: u32,
    pub metric: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default)]
    pub terminal: bool,
    /// Already resolved; raw payloads never reach the tracker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreRecord>,
    pub source: SignalSource,
}
