//! Whole-race completion detection.
//!
//! The detector only trusts terminal statuses reported by the agents'
//! trackers. It never infers completion from progress counters, so late or
//! reordered progress events cannot end a race early.

use std::collections::HashMap;

use tracing::warn;

use crate::domain::{AgentStatus, RaceError, Result};

#[derive(Debug, Clone)]
pub struct CompletionDetector {
    /// Registration order.
    agents: Vec<String>,
    terminal: HashMap<String, AgentStatus>,
}

impl CompletionDetector {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agents: agents.into_iter().map(Into::into).collect(),
            terminal: HashMap::new(),
        }
    }

    /// Record a terminal status and report whether the race is now complete.
    ///
    /// The first terminal status seen for an agent is kept.
    pub fn observe(&mut self, agent: &str, status: AgentStatus) -> Result<bool> {
        if !self.agents.iter().any(|a| a == agent) {
            return Err(RaceError::UnknownAgent(agent.to_string()));
        }
        if !status.is_terminal() {
            return Err(RaceError::InvalidTransition {
                agent: agent.to_string(),
                from: self
                    .terminal
                    .get(agent)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unobserved".to_string()),
                to: status.to_string(),
            });
        }
        match self.terminal.get(agent) {
            Some(previous) if *previous != status => {
                warn!(agent = %agent, kept = %previous, ignored = %status, "conflicting terminal status");
            }
            Some(_) => {}
            None => {
                self.terminal.insert(agent.to_string(), status);
            }
        }
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.agents.iter().all(|a| self.terminal.contains_key(a))
    }

    /// Agents without a terminal status, in registration order.
    pub fn pending(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|a| !self.terminal.contains_key(*a))
            .cloned()
            .collect()
    }

    pub fn status_of(&self, agent: &str) -> Option<AgentStatus> {
        self.terminal.get(agent).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TERMINAL: [AgentStatus; 3] = [
        AgentStatus::Finished,
        AgentStatus::Failed,
        AgentStatus::TimedOut,
    ];

    #[test]
    fn complete_only_when_every_agent_terminal() {
        let names = ["a", "b", "c", "d"];
        // Every choice of the one agent left running.
        for running in names {
            let mut d = CompletionDetector::new(names);
            for (i, name) in names.iter().enumerate() {
                if *name != running {
                    assert!(!d.observe(name, TERMINAL[i % 3]).unwrap());
                }
            }
            assert!(!d.is_complete());
            assert_eq!(d.pending(), vec![running.to_string()]);
            assert!(d.observe(running, AgentStatus::Finished).unwrap());
        }
    }

    #[test]
    fn repeated_observations_keep_first_status() {
        let mut d = CompletionDetector::new(["a", "b"]);
        d.observe("a", AgentStatus::Failed).unwrap();
        d.observe("a", AgentStatus::Finished).unwrap();
        assert_eq!(d.status_of("a"), Some(AgentStatus::Failed));
        assert!(!d.is_complete());
    }

    #[test]
    fn rejects_unknown_agents_and_live_statuses() {
        let mut d = CompletionDetector::new(["a"]);
        assert!(matches!(
            d.observe("zed", AgentStatus::Finished),
            Err(RaceError::UnknownAgent(_))
        ));
        assert!(matches!(
            d.observe("a", AgentStatus::Running),
            Err(RaceError::InvalidTransition { .. })
        ));
        assert!(!d.is_complete());
    }
}
