//! Race orchestration.
//!
//! [`RaceOrchestrator::start`] provisions one simulation instance per agent,
//! wires each agent's producers to its tracker and returns a [`RaceHandle`].
//! A coordinator task waits for every agent to go terminal, tears the
//! instances down and produces the immutable [`RaceRecord`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{
    run_event_channel, run_poller, AgentBoard, AgentSignal, AgentTracker, Backoff,
    CompletionNotice,
};
use crate::completion::CompletionDetector;
use crate::config::RaceConfig;
use crate::domain::{AgentEntry, AgentRun, Race, RaceError, RaceMeta, Result, TerminalCause};
use crate::history::RaceHistory;
use crate::leaderboard::RaceRecord;
use crate::metrics::METRICS;
use crate::obs::{self, RaceSpan};
use crate::provisioner::{ProcessLauncher, Provisioner, SimInstance, SimulationLauncher};
use crate::sim_client::{ClientFactory, HttpClientFactory};
use crate::supervisor::{supervise, DriverControl, DriverExit, DriverLimits, DriverSpec, OutputClassifier};

const SIGNAL_QUEUE: usize = 256;

/// The seams a race runs against.
pub struct RaceDeps {
    pub launcher: Arc<dyn SimulationLauncher>,
    pub clients: Arc<dyn ClientFactory>,
    pub history: Option<RaceHistory>,
}

impl RaceDeps {
    /// Local processes and HTTP/WebSocket clients.
    pub fn local(config: &RaceConfig) -> Result<Self> {
        Ok(Self {
            launcher: Arc::new(ProcessLauncher),
            clients: Arc::new(HttpClientFactory::new(&config.simulation)?),
            history: None,
        })
    }

    pub fn with_history(mut self, history: RaceHistory) -> Self {
        self.history = Some(history);
        self
    }
}

pub struct RaceOrchestrator {
    config: RaceConfig,
    deps: RaceDeps,
    classifier: Arc<OutputClassifier>,
}

impl RaceOrchestrator {
    pub fn new(config: RaceConfig, deps: RaceDeps) -> Result<Self> {
        config.validate()?;
        let classifier = Arc::new(OutputClassifier::from_config(&config.classifier)?);
        Ok(Self {
            config,
            deps,
            classifier,
        })
    }

    /// Provision and start the race.
    ///
    /// Fails only when provisioning fails; every instance started so far
    /// has been stopped by then. Per-agent failures after this point end up
    /// in the record instead.
    pub async fn start(self) -> Result<RaceHandle> {
        let Self {
            config,
            deps,
            classifier,
        } = self;
        let sim = &config.simulation;
        let limits = &config.limits;

        let provisioner = Provisioner::new(Arc::clone(&deps.launcher), Arc::clone(&deps.clients))
            .with_startup_timeout(Duration::from_millis(sim.startup_timeout_ms))
            .with_probe_interval(Duration::from_millis(sim.probe_interval_ms));
        let instances = provisioner.provision(config.instance_plan()).await?;
        check_shared_start(&instances).await;

        let entries: Vec<AgentEntry> = config
            .agents
            .iter()
            .zip(&instances)
            .enumerate()
            .map(|(registration, (agent, inst))| AgentEntry {
                name: agent.name.clone(),
                kind: agent.kind.clone(),
                endpoint: inst.endpoint().clone(),
                registration,
            })
            .collect();
        let race = Race::new(config.seed, config.scenario_id.clone(), config.duration, entries);
        let meta = race.meta().clone();
        let race_id = meta.race_id.to_string();
        {
            let _span = RaceSpan::enter(&race_id);
            obs::emit_race_started(&race_id, &meta.scenario_id, meta.seed, meta.agents.len());
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(meta.agents.len().max(1));
        let board = AgentBoard::new();
        let driver_limits = DriverLimits {
            max_steps: limits.max_steps,
            wall_clock: limits.wall_clock(),
            drain_timeout: limits.drain_timeout(),
        };
        let backoff = Backoff {
            initial: Duration::from_millis(limits.reconnect_initial_ms),
            max: Duration::from_millis(limits.reconnect_max_ms.max(limits.reconnect_initial_ms)),
        };

        let mut trackers = Vec::with_capacity(meta.agents.len());
        for ((entry, agent), inst) in meta.agents.iter().zip(&config.agents).zip(&instances) {
            let run = AgentRun::new(
                &entry.name,
                &entry.kind,
                entry.endpoint.clone(),
                entry.registration,
                limits.action_log_capacity,
            );
            let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_QUEUE);
            let (tracker, handles) = AgentTracker::new(
                run,
                config.duration,
                Arc::clone(&inst.client),
                signals_rx,
                cancel_rx.clone(),
                done_tx.clone(),
            );
            let tracker = tracker.with_final_fetch_timeout(Duration::from_millis(sim.request_timeout_ms));
            board.insert(&entry.name, handles.snapshot.clone());
            trackers.push((entry.name.clone(), tokio::spawn(tracker.run())));

            match DriverSpec::from_agent(agent, &entry.endpoint, config.instructions(), limits.max_steps) {
                Some(spec) => {
                    let control = DriverControl {
                        steps: handles.steps,
                        stop: handles.stop.clone(),
                        cancel: cancel_rx.clone(),
                    };
                    tokio::spawn(supervise(
                        spec,
                        driver_limits,
                        Arc::clone(&classifier),
                        control,
                        signals_tx.clone(),
                    ));
                }
                None => {
                    let exit = DriverExit::SpawnFailed {
                        reason: "empty driver command".to_string(),
                    };
                    // The queue is empty, so this cannot be full.
                    let _ = signals_tx.try_send(AgentSignal::Driver(exit));
                }
            }

            tokio::spawn(run_event_channel(
                entry.name.clone(),
                Arc::clone(&inst.client),
                signals_tx.clone(),
                handles.stop.clone(),
                backoff,
            ));
            tokio::spawn(run_poller(
                entry.name.clone(),
                Arc::clone(&inst.client),
                signals_tx,
                handles.stop,
                limits.poll_interval(),
            ));
        }
        drop(done_tx);

        let coordinator = Coordinator {
            race,
            board: board.clone(),
            trackers,
            done: done_rx,
            provisioner,
            instances,
            history: deps.history,
        };
        let task = tokio::spawn(coordinator.run());

        Ok(RaceHandle {
            monitor: RaceMonitor {
                meta: Arc::new(meta),
                board,
                cancel: Arc::new(cancel_tx),
            },
            task,
        })
    }

    /// Start the race and wait for its record.
    pub async fn run(self) -> Result<RaceRecord> {
        self.start().await?.wait().await
    }
}

/// Every instance must start from the same state. A mismatch is logged,
/// not fatal: the instances were launched with identical settings.
async fn check_shared_start(instances: &[SimInstance]) -> bool {
    let states = futures::future::join_all(instances.iter().map(|i| i.client.state())).await;
    let mut baseline: Option<(&str, u32, f64)> = None;
    let mut shared = true;
    for (inst, state) in instances.iter().zip(states) {
        let state = match state {
            Ok(state) => state,
            Err(e) => {
                debug!(agent = %inst.agent(), error = %e, "initial state unavailable");
                continue;
            }
        };
        match baseline {
            None => baseline = Some((inst.agent(), state.progress, state.metric)),
            Some((first, progress, metric)) => {
                if state.progress != progress || state.metric != metric {
                    shared = false;
                    warn!(
                        agent = %inst.agent(),
                        baseline = %first,
                        progress = state.progress,
                        metric = state.metric,
                        "instance starting state differs"
                    );
                }
            }
        }
    }
    shared
}

struct Coordinator {
    race: Race,
    board: AgentBoard,
    trackers: Vec<(String, JoinHandle<AgentRun>)>,
    done: mpsc::Receiver<CompletionNotice>,
    provisioner: Provisioner,
    instances: Vec<SimInstance>,
    history: Option<RaceHistory>,
}

impl Coordinator {
    async fn run(mut self) -> Result<RaceRecord> {
        let started = Instant::now();
        let names: Vec<String> = self.race.meta().agents.iter().map(|a| a.name.clone()).collect();
        let mut detector = CompletionDetector::new(names);

        while let Some(notice) = self.done.recv().await {
            match detector.observe(&notice.agent, notice.status) {
                Ok(true) => break,
                Ok(false) => debug!(pending = ?detector.pending(), "agent settled"),
                Err(e) => warn!(error = %e, "completion notice rejected"),
            }
        }

        let mut runs = Vec::with_capacity(self.trackers.len());
        for (name, tracker) in self.trackers {
            match tracker.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(agent = %name, error = %e, "tracker task failed");
                    if let Some(mut run) = self.board.get(&name) {
                        let _ = run.finish(TerminalCause::DriverCrashed { code: None });
                        runs.push(run);
                    }
                }
            }
        }
        self.provisioner.shutdown(self.instances).await;

        let cancelled = runs
            .iter()
            .any(|r| matches!(r.cause, Some(TerminalCause::Cancelled)));
        let record = {
            let race_id = self.race.race_id().to_string();
            let _span = RaceSpan::enter(&race_id);
            for run in runs {
                self.race.append_result(run)?;
            }
            let record = self.race.finalize(cancelled)?;
            obs::emit_race_completed(
                &race_id,
                started.elapsed().as_millis() as u64,
                record.winner().map(|w| w.agent.as_str()),
                cancelled,
            );
            METRICS.flush();
            record
        };

        if let Some(history) = &self.history {
            if let Err(e) = history.persist(&record).await {
                warn!(race_id = %record.meta.race_id, error = %e, "race record not persisted");
            }
        }
        Ok(record)
    }
}

/// Point-in-time view of a live race.
#[derive(Debug, Clone, Serialize)]
pub struct RaceStatus {
    pub race_id: Uuid,
    pub scenario_id: String,
    pub complete: bool,
    pub cancelled: bool,
    /// Registration order.
    pub agents: Vec<AgentRun>,
}

/// Cloneable view of a live race: status queries and cancellation from
/// anywhere, e.g. a signal handler or a progress printer.
#[derive(Clone)]
pub struct RaceMonitor {
    meta: Arc<RaceMeta>,
    board: AgentBoard,
    cancel: Arc<watch::Sender<bool>>,
}

impl RaceMonitor {
    /// Latest snapshot of every agent. Never blocks on the race.
    pub fn status(&self) -> RaceStatus {
        let agents = self.board.snapshot();
        RaceStatus {
            race_id: self.meta.race_id,
            scenario_id: self.meta.scenario_id.clone(),
            complete: !agents.is_empty() && agents.iter().all(AgentRun::is_terminal),
            cancelled: *self.cancel.borrow(),
            agents,
        }
    }

    /// Stop every still-running agent. Their runs end `timed_out` and the
    /// race still produces a record.
    pub fn cancel(&self) {
        if !self.cancel.send_replace(true) {
            info!(race_id = %self.meta.race_id, "race cancellation requested");
        }
    }
}

pub struct RaceHandle {
    monitor: RaceMonitor,
    task: JoinHandle<Result<RaceRecord>>,
}

impl RaceHandle {
    pub fn race_id(&self) -> Uuid {
        self.monitor.meta.race_id
    }

    pub fn meta(&self) -> &RaceMeta {
        &self.monitor.meta
    }

    pub fn status(&self) -> RaceStatus {
        self.monitor.status()
    }

    pub fn cancel(&self) {
        self.monitor.cancel();
    }

    pub fn monitor(&self) -> RaceMonitor {
        self.monitor.clone()
    }

    /// Wait for the final record.
    pub async fn wait(self) -> Result<RaceRecord> {
        self.task
            .await
            .map_err(|e| RaceError::Task(e.to_string()))?
    }
}
