//! Agent driver supervision.
//!
//! Each agent's driver is an opaque external process. [`supervise`] owns
//! it for its whole life: it spawns it with the endpoint and instructions,
//! classifies every output line, and kills it when a cap is hit, a fatal
//! line appears, the agent is stopped or the race is cancelled.

pub mod classify;

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::{raised, AgentSignal};
use crate::config::AgentConfig;
use crate::domain::{Endpoint, TerminalCause};
use crate::metrics::METRICS;

pub use classify::{LineClass, OutputClassifier};

const KILL_GRACE: Duration = Duration::from_secs(2);

/// A fully rendered driver command.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSpec {
    pub agent: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl DriverSpec {
    /// Render the agent's command template against its instance.
    ///
    /// Placeholders: `{endpoint}` `{instructions}` `{max_steps}` `{agent}`.
    /// Returns `None` for an empty command.
    pub fn from_agent(
        agent: &AgentConfig,
        endpoint: &Endpoint,
        instructions: &str,
        max_steps: u64,
    ) -> Option<Self> {
        let url = endpoint.base_url();
        let steps = max_steps.to_string();
        let render = |arg: &String| {
            arg.replace("{endpoint}", &url)
                .replace("{max_steps}", &steps)
                .replace("{agent}", &agent.name)
                .replace("{instructions}", instructions)
        };
        let mut argv = agent.command.iter().map(render);
        let program = argv.next()?;

        let mut env = vec![
            ("ARENA_ENDPOINT".to_string(), url.clone()),
            ("ARENA_INSTRUCTIONS".to_string(), instructions.to_string()),
            ("ARENA_MAX_STEPS".to_string(), steps.clone()),
            ("ARENA_AGENT".to_string(), agent.name.clone()),
        ];
        env.extend(agent.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        Some(Self {
            agent: agent.name.clone(),
            program,
            args: argv.collect(),
            env,
        })
    }

    /// Shell-script driver, for tests and ad-hoc races.
    pub fn shell(agent: &str, script: &str) -> Self {
        Self {
            agent: agent.to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: Vec::new(),
        }
    }
}

/// How a driver's supervision ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverExit {
    Exited { code: Option<i32> },
    Fatal { line: String },
    StepBudget { steps: u64, max: u64 },
    WallClock { limit: Duration },
    /// The run already went terminal through another signal.
    Stopped,
    Cancelled,
    SpawnFailed { reason: String },
}

impl DriverExit {
    /// Terminal cause implied by this exit. `Stopped` implies none.
    pub fn cause(&self) -> Option<TerminalCause> {
        Some(match self {
            DriverExit::Exited { code: Some(0) } => TerminalCause::DriverExited,
            DriverExit::Exited { code } => TerminalCause::DriverCrashed { code: *code },
            DriverExit::Fatal { line } => TerminalCause::FatalOutput { line: line.clone() },
            DriverExit::StepBudget { steps, max } => TerminalCause::StepBudget {
                steps: *steps,
                max: *max,
            },
            DriverExit::WallClock { limit } => TerminalCause::WallClock {
                limit_secs: limit.as_secs(),
            },
            DriverExit::Cancelled => TerminalCause::Cancelled,
            DriverExit::SpawnFailed { reason } => TerminalCause::SpawnFailed {
                reason: reason.clone(),
            },
            DriverExit::Stopped => return None,
        })
    }
}

/// Per-driver caps.
///
/// `max_steps` is checked against the tracker's step count, which follows
/// push-channel actions and any count the instance reports on a poll.
#[derive(Debug, Clone, Copy)]
pub struct DriverLimits {
    pub max_steps: u64,
    pub wall_clock: Duration,
    pub drain_timeout: Duration,
}

/// Signals the supervisor watches besides the process itself.
pub struct DriverControl {
    /// Driver-issued action count, published by the tracker.
    pub steps: watch::Receiver<u64>,
    /// Set when this agent's run went terminal.
    pub stop: watch::Receiver<bool>,
    /// Race-wide cancellation.
    pub cancel: watch::Receiver<bool>,
}

async fn budget_reached(rx: &mut watch::Receiver<u64>, max: u64) -> u64 {
    loop {
        let steps = *rx.borrow_and_update();
        if steps >= max {
            return steps;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_reader<R>(stream: R, lines: mpsc::Sender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Byte lines, decoded lossily: one bad byte must not close the pipe.
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if lines.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "driver output read failed");
                    break;
                }
            }
        }
    })
}

/// Log a line by class. Returns `true` for fatal lines.
fn note_line(agent: &str, classifier: &OutputClassifier, line: &str) -> bool {
    match classifier.classify(line) {
        LineClass::Fatal => {
            warn!(agent = %agent, line = %line, "fatal driver output");
            true
        }
        LineClass::Recoverable => {
            METRICS.inc_recoverable_errors();
            warn!(agent = %agent, line = %line, "recoverable driver error");
            false
        }
        LineClass::Unclassified => {
            METRICS.inc_unclassified_lines();
            warn!(
                agent = %agent,
                line = %line,
                "unclassified error-like driver output; consider adding a pattern"
            );
            false
        }
        LineClass::Info => {
            debug!(agent = %agent, line = %line, "driver output");
            false
        }
    }
}

/// Read what is still buffered after exit. Returns the first fatal line.
async fn drain(
    agent: &str,
    classifier: &OutputClassifier,
    lines: &mut mpsc::Receiver<String>,
    budget: Duration,
) -> Option<String> {
    let deadline = Instant::now() + budget;
    loop {
        match tokio::time::timeout_at(deadline, lines.recv()).await {
            Ok(Some(line)) => {
                if note_line(agent, classifier, &line) {
                    return Some(line);
                }
            }
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Kill the driver and everything it started in its process group.
async fn kill(agent: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        // SAFETY: plain kill(2) on the group the driver leads.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(agent = %agent, error = %e, "driver already gone");
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        warn!(agent = %agent, pid = ?child.id(), "driver did not exit after kill");
    }
}

/// Run one driver to completion.
///
/// Sends `DriverStarted` once spawned and `Driver(exit)` when done, and
/// returns the same exit.
#[instrument(skip_all, fields(agent = %spec.agent))]
pub async fn supervise(
    spec: DriverSpec,
    limits: DriverLimits,
    classifier: Arc<OutputClassifier>,
    mut control: DriverControl,
    signals: mpsc::Sender<AgentSignal>,
) -> DriverExit {
    let agent = spec.agent.clone();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so caps reach subprocesses too.
    #[cfg(unix)]
    command.process_group(0);
    let spawned = command.spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let exit = DriverExit::SpawnFailed {
                reason: format!("{}: {e}", spec.program),
            };
            warn!(agent = %agent, error = %e, "driver spawn failed");
            let _ = signals.send(AgentSignal::Driver(exit.clone())).await;
            return exit;
        }
    };

    let pid = child.id();
    info!(agent = %agent, pid = ?pid, program = %spec.program, "driver started");
    let _ = signals.send(AgentSignal::DriverStarted { pid }).await;

    let (line_tx, mut lines) = mpsc::channel::<String>(256);
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_reader(out, line_tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_reader(err, line_tx.clone()));
    }
    drop(line_tx);

    let deadline = tokio::time::sleep(limits.wall_clock);
    tokio::pin!(deadline);

    let exit = loop {
        tokio::select! {
            biased;
            _ = raised(&mut control.cancel) => break DriverExit::Cancelled,
            _ = raised(&mut control.stop) => break DriverExit::Stopped,
            _ = &mut deadline => break DriverExit::WallClock { limit: limits.wall_clock },
            steps = budget_reached(&mut control.steps, limits.max_steps) => {
                break DriverExit::StepBudget { steps, max: limits.max_steps };
            }
            Some(line) = lines.recv() => {
                if note_line(&agent, &classifier, &line) {
                    break DriverExit::Fatal { line };
                }
            }
            status = child.wait() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(agent = %agent, error = %e, "wait on driver failed");
                        None
                    }
                };
                // A fatal line printed just before exit still decides the outcome.
                break match drain(&agent, &classifier, &mut lines, limits.drain_timeout).await {
                    Some(line) => DriverExit::Fatal { line },
                    None => DriverExit::Exited { code },
                };
            }
        }
    };

    if !matches!(exit, DriverExit::Exited { .. }) {
        kill(&agent, &mut child).await;
    }
    for reader in readers {
        reader.abort();
    }

    info!(agent = %agent, exit = ?exit, "driver supervision ended");
    let _ = signals.send(AgentSignal::Driver(exit.clone())).await;
    exit
}
