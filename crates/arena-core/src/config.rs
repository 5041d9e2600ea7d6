//! Race configuration.
//!
//! A race is described by one TOML file:
//!
//! ```toml
//! scenario_id = "vending"
//! seed = 1234
//! duration = 30
//! instructions_file = "prompts/vending.md"
//!
//! [params]
//! starting_balance = "500"
//!
//! [simulation]
//! command = ["python", "-m", "sim.server", "--port", "{port}", "--seed", "{seed}"]
//! base_port = 4100
//!
//! [limits]
//! max_steps = 200
//! wall_clock_secs = 1800
//!
//! [[agents]]
//! name = "claude"
//! kind = "claude-cli"
//! command = ["claude", "-p", "{instructions}", "--endpoint", "{endpoint}"]
//! ```
//!
//! `ARENA_SEED` and `ARENA_BASE_PORT` override the file values.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::domain::{Endpoint, RaceError, Result};
use crate::provisioner::InstanceSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RaceConfig {
    pub scenario_id: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Progress units the scenario runs for (e.g. simulated days).
    pub duration: u32,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Read into `instructions` by [`RaceConfig::load`]; relative to the
    /// config file.
    #[serde(default)]
    pub instructions_file: Option<PathBuf>,
    /// Scenario parameters, passed identically to every instance.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Command template. Placeholders: `{port}` `{host}` `{seed}`
    /// `{scenario}` `{duration}`.
    pub command: Vec<String>,
    pub host: String,
    pub base_port: u16,
    pub startup_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub health_path: String,
    pub state_path: String,
    pub ws_path: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            host: "127.0.0.1".to_string(),
            base_port: 4100,
            startup_timeout_ms: 5_000,
            probe_interval_ms: 100,
            request_timeout_ms: 2_000,
            health_path: "/api/health".to_string(),
            state_path: "/api/state".to_string(),
            ws_path: "/ws".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    pub max_steps: u64,
    pub wall_clock_secs: u64,
    pub poll_interval_ms: u64,
    pub action_log_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// How long to keep reading buffered driver output after exit.
    pub drain_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_steps: 200,
            wall_clock_secs: 1_800,
            poll_interval_ms: 5_000,
            action_log_capacity: crate::domain::timeline::DEFAULT_ACTION_LOG_CAPACITY,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 5_000,
            drain_timeout_ms: 500,
        }
    }
}

impl LimitsConfig {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Driver output patterns. Matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub fatal: Vec<String>,
    pub recoverable: Vec<String>,
    /// Lines matching these but no pattern above are flagged as
    /// unclassified errors.
    pub error_hints: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let owned = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        Self {
            fatal: owned(&[
                r"authentication_error",
                r"invalid[ _]api[ _]key",
                r"401 unauthorized",
                r"please run /login",
                r"permission_error",
                r"credit balance is too low",
                r"^traceback \(most recent call last\)",
                r"panicked at",
                r"command not found",
            ]),
            recoverable: owned(&[
                r"rate_limit_error",
                r"\b429\b",
                r"overloaded_error",
                r"\b529\b",
                r"retrying in",
                r"resource_exhausted",
                r"timed? ?out.*retry",
            ]),
            error_hints: owned(&[r"\berror\b", r"\bexception\b", r"\bfatal\b", r"\bfailed\b"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Driver command template. Placeholders: `{endpoint}`
    /// `{instructions}` `{max_steps}` `{agent}`.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_seed() -> u64 {
    42
}

fn default_kind() -> String {
    "agent".to_string()
}

impl RaceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read, resolve `instructions_file`, apply environment overrides and
    /// validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;

        if config.instructions.is_none() {
            if let Some(file) = &config.instructions_file {
                let resolved = match path.parent() {
                    Some(dir) if file.is_relative() => dir.join(file),
                    _ => file.clone(),
                };
                config.instructions = Some(std::fs::read_to_string(resolved)?);
            }
        }

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ARENA_SEED` / `ARENA_BASE_PORT` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ARENA_SEED") {
            self.seed = raw
                .trim()
                .parse()
                .map_err(|_| RaceError::InvalidConfig(format!("ARENA_SEED={raw} is not a u64")))?;
        }
        if let Some(raw) = lookup("ARENA_BASE_PORT") {
            self.simulation.base_port = raw.trim().parse().map_err(|_| {
                RaceError::InvalidConfig(format!("ARENA_BASE_PORT={raw} is not a port"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RaceError::InvalidConfig(msg));

        if self.scenario_id.trim().is_empty() {
            return invalid("scenario_id is empty".to_string());
        }
        if self.duration == 0 {
            return invalid("duration must be at least 1".to_string());
        }
        if self.agents.is_empty() {
            return invalid("no agents configured".to_string());
        }
        if self.simulation.command.is_empty() {
            return invalid("simulation.command is empty".to_string());
        }
        if self.limits.max_steps == 0 || self.limits.wall_clock_secs == 0 {
            return invalid("limits.max_steps and limits.wall_clock_secs must be positive".to_string());
        }
        if self.limits.poll_interval_ms == 0 {
            return invalid("limits.poll_interval_ms must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return invalid("agent with empty name".to_string());
            }
            if !seen.insert(agent.name.as_str()) {
                return invalid(format!("duplicate agent name {}", agent.name));
            }
            if agent.command.is_empty() {
                return invalid(format!("agent {} has an empty command", agent.name));
            }
        }

        let last = u32::from(self.simulation.base_port) + self.agents.len() as u32 - 1;
        if last > u32::from(u16::MAX) {
            return invalid(format!(
                "base_port {} leaves no room for {} agents",
                self.simulation.base_port,
                self.agents.len()
            ));
        }

        let c = &self.classifier;
        for pattern in c.fatal.iter().chain(&c.recoverable).chain(&c.error_hints) {
            if let Err(e) = RegexBuilder::new(pattern).case_insensitive(true).build() {
                return invalid(format!("bad classifier pattern {pattern:?}: {e}"));
            }
        }
        Ok(())
    }

    pub fn instructions(&self) -> &str {
        self.instructions.as_deref().unwrap_or("")
    }

    /// One instance per agent, identical except for the endpoint.
    pub fn instance_plan(&self) -> Vec<InstanceSpec> {
        self.agents
            .iter()
            .enumerate()
            .map(|(ordinal, agent)| InstanceSpec {
                agent: agent.name.clone(),
                ordinal,
                endpoint: Endpoint::new(
                    self.simulation.host.clone(),
                    self.simulation.base_port.saturating_add(ordinal as u16),
                ),
                seed: self.seed,
                scenario_id: self.scenario_id.clone(),
                duration: self.duration,
                params: self.params.clone(),
                command: self.simulation.command.clone(),
            })
            .collect()
    }
}
