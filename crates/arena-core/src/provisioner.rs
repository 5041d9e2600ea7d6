//! Simulation instance provisioning.
//!
//! One isolated simulation process per agent, all started from the same
//! seed and scenario parameters. Provisioning is all-or-nothing: if any
//! instance fails to launch or become ready, every instance started so far
//! is stopped before the error is returned.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::domain::{Endpoint, RaceError, Result};
use crate::obs;
use crate::sim_client::{ClientFactory, SimulationClient};

/// Launch parameters for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSpec {
    pub agent: String,
    pub ordinal: usize,
    pub endpoint: Endpoint,
    pub seed: u64,
    pub scenario_id: String,
    pub duration: u32,
    pub params: BTreeMap<String, String>,
    pub command: Vec<String>,
}

impl InstanceSpec {
    /// The command with `{port}` `{host}` `{seed}` `{scenario}` `{duration}`
    /// substituted.
    pub fn render_command(&self) -> Vec<String> {
        let port = self.endpoint.port.to_string();
        let seed = self.seed.to_string();
        let duration = self.duration.to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port)
                    .replace("{host}", &self.endpoint.host)
                    .replace("{seed}", &seed)
                    .replace("{scenario}", &self.scenario_id)
                    .replace("{duration}", &duration)
            })
            .collect()
    }

    /// Environment exported to the instance process.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("ARENA_HOST".to_string(), self.endpoint.host.clone()),
            ("ARENA_PORT".to_string(), self.endpoint.port.to_string()),
            ("ARENA_SEED".to_string(), self.seed.to_string()),
            ("ARENA_SCENARIO".to_string(), self.scenario_id.clone()),
            ("ARENA_DURATION".to_string(), self.duration.to_string()),
        ];
        for (k, v) in &self.params {
            env.push((format!("ARENA_PARAM_{}", k.to_ascii_uppercase()), v.clone()));
        }
        env
    }
}

/// Handle to a launched instance process.
#[async_trait]
pub trait InstanceProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Exit description if the process has already ended.
    fn try_exit(&mut self) -> Option<String>;

    /// Terminate and reap, waiting at most `grace`.
    async fn stop(&mut self, grace: Duration);
}

#[async_trait]
pub trait SimulationLauncher: Send + Sync {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Box<dyn InstanceProcess>>;
}

/// Launches instances as local child processes.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

struct ChildInstance {
    child: Child,
}

#[async_trait]
impl InstanceProcess for ChildInstance {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("wait failed: {e}")),
        }
    }

    async fn stop(&mut self, grace: Duration) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "kill on already-exited instance");
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            warn!(pid = ?self.child.id(), "instance did not exit within grace period");
        }
    }
}

#[async_trait]
impl SimulationLauncher for ProcessLauncher {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Box<dyn InstanceProcess>> {
        let fail = |reason: String| RaceError::Provisioning {
            agent: spec.agent.clone(),
            reason,
        };

        // Refuse ports something else already holds.
        std::net::TcpListener::bind((spec.endpoint.host.as_str(), spec.endpoint.port))
            .map_err(|e| fail(format!("endpoint {} unavailable: {e}", spec.endpoint)))?;

        let argv = spec.render_command();
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| fail("empty simulation command".to_string()))?;

        let child = Command::new(exe)
            .args(args)
            .envs(spec.env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("spawn {exe}: {e}")))?;

        debug!(agent = %spec.agent, pid = ?child.id(), endpoint = %spec.endpoint, "simulation launched");
        Ok(Box::new(ChildInstance { child }))
    }
}

/// A provisioned, ready instance.
pub struct SimInstance {
    pub spec: InstanceSpec,
    pub client: Arc<dyn SimulationClient>,
    process: Box<dyn InstanceProcess>,
}

impl SimInstance {
    pub fn agent(&self) -> &str {
        &self.spec.agent
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.spec.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }
}

impl std::fmt::Debug for SimInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimInstance")
            .field("agent", &self.spec.agent)
            .field("endpoint", &self.spec.endpoint)
            .finish()
    }
}

pub struct Provisioner {
    launcher: Arc<dyn SimulationLauncher>,
    clients: Arc<dyn ClientFactory>,
    startup_timeout: Duration,
    probe_interval: Duration,
    stop_grace: Duration,
}

impl Provisioner {
    pub fn new(launcher: Arc<dyn SimulationLauncher>, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            launcher,
            clients,
            startup_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(100),
            stop_grace: Duration::from_secs(2),
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Start every instance in `plan` and wait until each is ready.
    #[instrument(skip_all, fields(instances = plan.len()))]
    pub async fn provision(&self, plan: Vec<InstanceSpec>) -> Result<Vec<SimInstance>> {
        let mut owners: HashMap<&Endpoint, &str> = HashMap::new();
        for spec in &plan {
            if let Some(other) = owners.insert(&spec.endpoint, &spec.agent) {
                let err = RaceError::Provisioning {
                    agent: spec.agent.clone(),
                    reason: format!("endpoint {} already assigned to {other}", spec.endpoint),
                };
                obs::emit_provision_failed(&spec.agent, &err);
                return Err(err);
            }
        }

        let mut started: Vec<SimInstance> = Vec::with_capacity(plan.len());
        for spec in &plan {
            match self.launcher.launch(spec).await {
                Ok(process) => started.push(SimInstance {
                    client: self.clients.client(&spec.endpoint),
                    spec: spec.clone(),
                    process,
                }),
                Err(err) => {
                    obs::emit_provision_failed(&spec.agent, &err);
                    self.shutdown(started).await;
                    return Err(err);
                }
            }
        }

        let probes = started.iter_mut().map(|inst| self.wait_ready(inst));
        let outcomes = futures::future::join_all(probes).await;
        if let Some(err) = outcomes.into_iter().find_map(|r| r.err()) {
            if let RaceError::Provisioning { agent, .. } = &err {
                obs::emit_provision_failed(agent, &err);
            }
            self.shutdown(started).await;
            return Err(err);
        }

        for inst in &started {
            info!(agent = %inst.spec.agent, endpoint = %inst.spec.endpoint, pid = ?inst.pid(), "simulation ready");
        }
        Ok(started)
    }

    async fn wait_ready(&self, inst: &mut SimInstance) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(exit) = inst.process.try_exit() {
                return Err(RaceError::Provisioning {
                    agent: inst.spec.agent.clone(),
                    reason: format!("instance exited before ready ({exit})"),
                });
            }
            if inst.client.ready().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RaceError::Provisioning {
                    agent: inst.spec.agent.clone(),
                    reason: format!(
                        "not ready after {}ms at {}",
                        self.startup_timeout.as_millis(),
                        inst.spec.endpoint
                    ),
                });
            }
            tokio::time::sleep(self.probe_interval).await;
        }
    }

    /// Stop every instance. Never fails; problems are logged.
    pub async fn shutdown(&self, instances: Vec<SimInstance>) {
        let stops = instances.into_iter().map(|mut inst| async move {
            inst.process.stop(self.stop_grace).await;
            debug!(agent = %inst.spec.agent, "simulation stopped");
        });
        futures::future::join_all(stops).await;
    }
}
