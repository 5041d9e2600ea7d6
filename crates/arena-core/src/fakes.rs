//! In-memory fakes for the simulation seams (testing only)
//!
//! `FakeLauncher` stands in for real simulation processes and
//! `ScriptedClientFactory` hands out clients that replay a scripted push
//! channel, so races can run end to end without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::domain::{Endpoint, RaceError, Result};
use crate::provisioner::{InstanceProcess, InstanceSpec, SimulationLauncher};
use crate::sim_client::{ClientFactory, SimMessage, SimState, SimulationClient};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Records launches and stops instead of spawning processes.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<String>>,
    stopped: Arc<Mutex<Vec<String>>>,
    fail_launch: HashSet<String>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make launching `agent`'s instance fail.
    pub fn failing_launch(mut self, agent: &str) -> Self {
        self.fail_launch.insert(agent.to_string());
        self
    }

    pub fn launched(&self) -> Vec<String> {
        lock(&self.launched).clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        lock(&self.stopped).clone()
    }
}

struct FakeProcess {
    agent: String,
    stopped: Arc<Mutex<Vec<String>>>,
    exited: bool,
}

#[async_trait]
impl InstanceProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn try_exit(&mut self) -> Option<String> {
        self.exited.then(|| "stopped".to_string())
    }

    async fn stop(&mut self, _grace: Duration) {
        if !self.exited {
            self.exited = true;
            lock(&self.stopped).push(self.agent.clone());
        }
    }
}

#[async_trait]
impl SimulationLauncher for FakeLauncher {
    async fn launch(&self, spec: &InstanceSpec) -> Result<Box<dyn InstanceProcess>> {
        if self.fail_launch.contains(&spec.agent) {
            return Err(RaceError::Provisioning {
                agent: spec.agent.clone(),
                reason: "launch refused".to_string(),
            });
        }
        lock(&self.launched).push(spec.agent.clone());
        Ok(Box::new(FakeProcess {
            agent: spec.agent.clone(),
            stopped: Arc::clone(&self.stopped),
            exited: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Scripted client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Message(SimMessage),
    /// End the current subscription; the next one resumes the script.
    Disconnect,
}

/// `state_changed` push message.
pub fn state_msg(progress: u32, metric: f64) -> SimMessage {
    SimMessage::StateChanged {
        state: SimState {
            progress,
            metric,
            terminal: false,
            score: None,
            steps: None,
        },
        action: None,
    }
}

/// Terminal `state_changed` push message carrying a raw score payload.
pub fn terminal_msg(progress: u32, metric: f64, score: Value) -> SimMessage {
    SimMessage::StateChanged {
        state: SimState {
            progress,
            metric,
            terminal: true,
            score: Some(score),
            steps: None,
        },
        action: None,
    }
}

/// `agent_action` push message.
pub fn action_msg(description: &str) -> SimMessage {
    SimMessage::AgentAction {
        description: description.to_string(),
        progress: None,
    }
}

/// A simulation client that replays a script.
///
/// Pushed `state_changed` messages also update the state returned by
/// [`SimulationClient::state`], as a real instance would.
pub struct ScriptedClient {
    endpoint: Endpoint,
    never_ready: AtomicBool,
    refuse_subscribe: AtomicBool,
    state: Arc<Mutex<SimState>>,
    script: Mutex<VecDeque<ScriptStep>>,
    step_delay: Mutex<Duration>,
    subscriptions: AtomicU32,
    state_queries: AtomicU32,
}

impl ScriptedClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            never_ready: AtomicBool::new(false),
            refuse_subscribe: AtomicBool::new(false),
            state: Arc::new(Mutex::new(SimState {
                progress: 0,
                metric: 0.0,
                terminal: false,
                score: None,
                steps: None,
            })),
            script: Mutex::new(VecDeque::new()),
            step_delay: Mutex::new(Duration::from_millis(5)),
            subscriptions: AtomicU32::new(0),
            state_queries: AtomicU32::new(0),
        }
    }

    pub fn never_ready(&self) -> &Self {
        self.never_ready.store(true, Ordering::SeqCst);
        self
    }

    /// Every subscribe attempt fails; only polling sees the instance.
    pub fn refuse_subscribe(&self) -> &Self {
        self.refuse_subscribe.store(true, Ordering::SeqCst);
        self
    }

    pub fn push(&self, message: SimMessage) -> &Self {
        lock(&self.script).push_back(ScriptStep::Message(message));
        self
    }

    pub fn disconnect(&self) -> &Self {
        lock(&self.script).push_back(ScriptStep::Disconnect);
        self
    }

    pub fn step_delay(&self, delay: Duration) -> &Self {
        *lock(&self.step_delay) = delay;
        self
    }

    pub fn set_state(&self, state: SimState) -> &Self {
        *lock(&self.state) = state;
        self
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn state_queries(&self) -> u32 {
        self.state_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SimulationClient for ScriptedClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn ready(&self) -> bool {
        !self.never_ready.load(Ordering::SeqCst)
    }

    async fn state(&self) -> Result<SimState> {
        self.state_queries.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.state).clone())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, Result<SimMessage>>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(RaceError::Channel {
                endpoint: self.endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let mut batch = Vec::new();
        let mut closes = false;
        {
            let mut script = lock(&self.script);
            while let Some(step) = script.pop_front() {
                match step {
                    ScriptStep::Message(m) => batch.push(m),
                    ScriptStep::Disconnect => {
                        closes = true;
                        break;
                    }
                }
            }
        }

        let delay = *lock(&self.step_delay);
        let state = Arc::clone(&self.state);
        let delivered = futures::stream::iter(batch).then(move |m| {
            let state = Arc::clone(&state);
            async move {
                tokio::time::sleep(delay).await;
                if let SimMessage::StateChanged { state: s, .. } = &m {
                    *lock(&state) = s.clone();
                }
                Ok(m)
            }
        });

        if closes {
            Ok(delivered.boxed())
        } else {
            Ok(delivered.chain(futures::stream::pending()).boxed())
        }
    }
}

/// Hands out one [`ScriptedClient`] per endpoint.
#[derive(Default)]
pub struct ScriptedClientFactory {
    clients: Mutex<HashMap<Endpoint, Arc<ScriptedClient>>>,
}

impl ScriptedClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The client for `endpoint`, created idle and ready if absent.
    pub fn script(&self, endpoint: Endpoint) -> Arc<ScriptedClient> {
        let mut clients = lock(&self.clients);
        Arc::clone(
            clients
                .entry(endpoint.clone())
                .or_insert_with(|| Arc::new(ScriptedClient::new(endpoint))),
        )
    }
}

impl ClientFactory for ScriptedClientFactory {
    fn client(&self, endpoint: &Endpoint) -> Arc<dyn SimulationClient> {
        self.script(endpoint.clone())
    }
}
