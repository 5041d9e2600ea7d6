//! Structured observability hooks for race lifecycle events.
//!
//! This module provides:
//! - Race-scoped tracing spans via `RaceSpan` RAII guard
//! - Emission functions for key lifecycle events: race start, agent terminal,
//!   stale event, race completion, provisioning failure
//!
//! Events are emitted at `info!` level unless noted. For JSON output run the
//! CLI with `--json`.

use tracing::info;

use crate::domain::AgentStatus;

/// RAII guard that enters a race-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = RaceSpan::enter("5f0c…");
/// // every event below carries race_id
/// ```
pub struct RaceSpan {
    _span: tracing::span::EnteredSpan,
}

impl RaceSpan {
    /// Create and enter a span tagged with the race_id.
    pub fn enter(race_id: &str) -> Self {
        let span = tracing::info_span!("arena.race", race_id = %race_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: race started with its shared conditions.
pub fn emit_race_started(race_id: &str, scenario_id: &str, seed: u64, agents: usize) {
    info!(
        event = "race.started",
        race_id = %race_id,
        scenario_id = %scenario_id,
        seed = seed,
        agents = agents,
    );
}

/// Emit event: an agent reached its terminal status.
pub fn emit_agent_terminal(
    agent: &str,
    status: AgentStatus,
    reason: Option<&str>,
    final_metric: Option<f64>,
) {
    info!(
        event = "agent.terminal",
        agent = %agent,
        status = %status,
        reason = reason.unwrap_or(""),
        final_metric = final_metric,
    );
}

/// Emit event: a progress or action event arrived after terminal and was
/// dropped (debug level).
pub fn emit_stale_event(agent: &str, source: &str, progress: u32) {
    tracing::debug!(
        event = "agent.stale_event",
        agent = %agent,
        source = %source,
        progress = progress,
    );
}

/// Emit event: race completed and its record was produced.
pub fn emit_race_completed(race_id: &str, duration_ms: u64, winner: Option<&str>, cancelled: bool) {
    info!(
        event = "race.completed",
        race_id = %race_id,
        duration_ms = duration_ms,
        winner = winner.unwrap_or(""),
        cancelled = cancelled,
    );
}

/// Emit event: provisioning failed and the race was rolled back (warning level).
pub fn emit_provision_failed(agent: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "race.provision_failed", agent = %agent, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn race_span_create() {
        let _span = RaceSpan::enter("test-race-id");
        emit_stale_event("claude", "poll", 3);
    }
}
