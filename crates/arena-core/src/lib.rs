//! Arena Core Library
//!
//! Races AI agents against identical simulation instances and ranks them:
//!
//! - `provisioner`: one simulation instance per agent, shared seed and config
//! - `supervisor`: agent driver processes, output classification and caps
//! - `aggregator`: per-agent live state from push events and polling
//! - `completion`: whole-race completion from terminal statuses only
//! - `leaderboard`: final ranking and the immutable race record
//! - `orchestrator`: wires the above into one race with a live handle

pub mod aggregator;
pub mod completion;
pub mod config;
pub mod domain;
pub mod fakes;
pub mod history;
pub mod leaderboard;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod provisioner;
pub mod sim_client;
pub mod supervisor;
pub mod telemetry;

pub use aggregator::{AgentBoard, AgentSignal, AgentTracker, CompletionNotice};
pub use completion::CompletionDetector;
pub use config::{AgentConfig, ClassifierConfig, LimitsConfig, RaceConfig, SimulationConfig};
pub use domain::{
    ActionEntry, ActionLog, AgentEntry, AgentRun, AgentStatus, DimensionScore, Endpoint,
    MetricPoint, MetricSeries, ProgressEvent, Race, RaceError, RaceMeta, Result, ScoreError,
    ScoreRecord, ScoreScheme, SignalSource, TerminalCause,
};
pub use history::RaceHistory;
pub use leaderboard::{build_leaderboard, LeaderboardEntry, RaceRecord, RECORD_SCHEMA_VERSION};
pub use orchestrator::{RaceDeps, RaceHandle, RaceMonitor, RaceOrchestrator, RaceStatus};
pub use provisioner::{
    InstanceProcess, InstanceSpec, ProcessLauncher, Provisioner, SimInstance, SimulationLauncher,
};
pub use sim_client::{
    ClientFactory, HttpClientFactory, HttpSimulationClient, SimMessage, SimState, SimulationClient,
};
pub use supervisor::{DriverExit, DriverSpec, LineClass, OutputClassifier};
