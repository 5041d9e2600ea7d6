//! Live state aggregation.
//!
//! Three producers run per agent and feed one [`AgentSignal`] queue:
//!
//! - the driver supervisor (process start and exit),
//! - the event channel task (push updates, with reconnects),
//! - the poller (periodic state fetch, for channels that stall silently).
//!
//! The queue is drained by that agent's [`AgentTracker`], the only writer
//! of its [`AgentRun`]. Every change is published on a `watch` channel and
//! the [`AgentBoard`] maps agent names to those receivers for status
//! queries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{
    AgentRun, AgentStatus, IngestOutcome, ProgressEvent, RaceError, SeriesUpdate, SignalSource,
    TerminalCause,
};
use crate::metrics::METRICS;
use crate::obs;
use crate::sim_client::{SimMessage, SimulationClient};
use crate::supervisor::DriverExit;

/// Everything a tracker can be told about its agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentSignal {
    Progress(ProgressEvent),
    Action {
        description: String,
        progress: Option<u32>,
    },
    DriverStarted {
        pid: Option<u32>,
    },
    Driver(DriverExit),
    /// Action count reported by the instance itself.
    StepCount(u64),
    ChannelUp,
    ChannelDown {
        reason: String,
    },
}

/// Sent to the completion detector when a run goes terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionNotice {
    pub agent: String,
    pub status: AgentStatus,
}

/// Resolves once `rx` holds `true`; never resolves if the sender is gone.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Receivers handed to an agent's producers.
pub struct TrackerHandles {
    pub snapshot: watch::Receiver<AgentRun>,
    pub steps: watch::Receiver<u64>,
    pub stop: watch::Receiver<bool>,
}

pub struct AgentTracker {
    run: AgentRun,
    duration: u32,
    client: Arc<dyn SimulationClient>,
    signals: mpsc::Receiver<AgentSignal>,
    snapshot: watch::Sender<AgentRun>,
    steps: watch::Sender<u64>,
    stop: watch::Sender<bool>,
    cancel: watch::Receiver<bool>,
    completion: mpsc::Sender<CompletionNotice>,
    final_fetch_timeout: Duration,
}

impl AgentTracker {
    pub fn new(
        run: AgentRun,
        duration: u32,
        client: Arc<dyn SimulationClient>,
        signals: mpsc::Receiver<AgentSignal>,
        cancel: watch::Receiver<bool>,
        completion: mpsc::Sender<CompletionNotice>,
    ) -> (Self, TrackerHandles) {
        let (snapshot, snapshot_rx) = watch::channel(run.clone());
        let (steps, steps_rx) = watch::channel(run.steps);
        let (stop, stop_rx) = watch::channel(false);
        let tracker = Self {
            run,
            duration,
            client,
            signals,
            snapshot,
            steps,
            stop,
            cancel,
            completion,
            final_fetch_timeout: Duration::from_secs(2),
        };
        (
            tracker,
            TrackerHandles {
                snapshot: snapshot_rx,
                steps: steps_rx,
                stop: stop_rx,
            },
        )
    }

    pub fn with_final_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.final_fetch_timeout = timeout;
        self
    }

    /// Apply signals until every producer has hung up. Returns the settled run.
    pub async fn run(mut self) -> AgentRun {
        loop {
            let live = !self.run.is_terminal();
            tokio::select! {
                _ = raised(&mut self.cancel), if live => {
                    self.finish(TerminalCause::Cancelled).await;
                }
                signal = self.signals.recv() => match signal {
                    Some(signal) => self.apply(signal).await,
                    None => break,
                },
            }
            self.publish();
        }

        if !self.run.is_terminal() {
            // Every producer is gone without a verdict; the driver must have
            // been lost.
            warn!(agent = %self.run.name, "all producers stopped before a terminal signal");
            self.finish(TerminalCause::DriverCrashed { code: None }).await;
            self.publish();
        }
        self.run
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.run.clone());
    }

    async fn apply(&mut self, signal: AgentSignal) {
        match signal {
            AgentSignal::Progress(event) => self.apply_progress(event).await,
            AgentSignal::Action {
                description,
                progress,
            } => {
                if self.run.record_action(&description, progress) {
                    self.steps.send_replace(self.run.steps);
                } else {
                    METRICS.inc_stale_events();
                    obs::emit_stale_event(&self.run.name, "action", progress.unwrap_or(self.run.progress));
                }
            }
            AgentSignal::StepCount(observed) => {
                if self.run.sync_steps(observed) {
                    self.steps.send_replace(self.run.steps);
                }
            }
            AgentSignal::DriverStarted { pid } => {
                if self.run.status == AgentStatus::Provisioning {
                    if let Err(e) = self.run.mark_running(pid) {
                        warn!(agent = %self.run.name, error = %e, "cannot mark run as running");
                    }
                }
            }
            AgentSignal::Driver(exit) => match exit.cause() {
                Some(cause) if !self.run.is_terminal() => self.finish(cause).await,
                _ => debug!(agent = %self.run.name, exit = ?exit, "driver exit after terminal"),
            },
            AgentSignal::ChannelUp => {
                if !self.run.is_terminal() {
                    let before = self.run.reconnects;
                    self.run.set_channel(true);
                    if self.run.reconnects > before {
                        METRICS.inc_channel_reconnects();
                        info!(agent = %self.run.name, reconnects = self.run.reconnects, "event channel reconnected");
                    }
                }
            }
            AgentSignal::ChannelDown { reason } => {
                if !self.run.is_terminal() {
                    warn!(agent = %self.run.name, reason = %reason, "event channel down");
                }
                self.run.set_channel(false);
            }
        }
    }

    async fn apply_progress(&mut self, event: ProgressEvent) {
        METRICS.inc_events_ingested();
        match self.run.ingest(&event, self.duration) {
            IngestOutcome::Stale => {
                METRICS.inc_stale_events();
                obs::emit_stale_event(&self.run.name, &event.source.to_string(), event.progress);
            }
            IngestOutcome::Applied { update, finish } => {
                if update == SeriesUpdate::Corrected {
                    METRICS.inc_corrections();
                    debug!(
                        agent = %self.run.name,
                        progress = event.progress,
                        latest = self.run.progress,
                        source = %event.source,
                        "out-of-order progress treated as correction"
                    );
                }
                if let Some(cause) = finish {
                    self.finish(cause).await;
                }
            }
        }
    }

    /// Fetch the instance's final state once when no score is known yet.
    async fn fetch_final(&mut self) {
        if self.run.score.is_some() {
            return;
        }
        match tokio::time::timeout(self.final_fetch_timeout, self.client.state()).await {
            Ok(Ok(state)) => {
                let event = state.into_event(&self.run.name, None, SignalSource::Final);
                if event.progress < self.run.progress {
                    // A lagging final state never rewinds the timeline.
                    if let Some(score) = event.score {
                        self.run.set_score(score);
                    }
                } else {
                    // The pending cause decides the outcome, not this event.
                    let _ = self.run.ingest(&event, self.duration);
                }
            }
            Ok(Err(e)) => {
                debug!(agent = %self.run.name, error = %e, "final state fetch failed");
            }
            Err(_) => {
                debug!(agent = %self.run.name, "final state fetch timed out");
            }
        }
    }

    async fn finish(&mut self, cause: TerminalCause) {
        if self.run.is_terminal() {
            return;
        }
        self.fetch_final().await;
        match self.run.finish(cause) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(agent = %self.run.name, error = %e, "terminal transition rejected");
                return;
            }
        }

        self.stop.send_replace(true);
        obs::emit_agent_terminal(
            &self.run.name,
            self.run.status,
            self.run.cause.as_ref().map(|c| c.reason()).as_deref(),
            self.run.latest_metric(),
        );
        let notice = CompletionNotice {
            agent: self.run.name.clone(),
            status: self.run.status,
        };
        if self.completion.send(notice).await.is_err() {
            debug!(agent = %self.run.name, "completion detector gone");
        }
    }
}

/// Reconnect delay policy for the event channel.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Push-channel producer. Subscribes, forwards messages and reconnects
/// with capped exponential backoff until `stop` is raised.
pub async fn run_event_channel(
    agent: String,
    client: Arc<dyn SimulationClient>,
    signals: mpsc::Sender<AgentSignal>,
    mut stop: watch::Receiver<bool>,
    backoff: Backoff,
) {
    let mut delay = backoff.initial;
    loop {
        let subscribed = tokio::select! {
            _ = raised(&mut stop) => return,
            r = client.subscribe() => r,
        };

        match subscribed {
            Ok(mut stream) => {
                delay = backoff.initial;
                if signals.send(AgentSignal::ChannelUp).await.is_err() {
                    return;
                }
                loop {
                    let next = tokio::select! {
                        _ = raised(&mut stop) => return,
                        m = stream.next() => m,
                    };
                    let signal = match next {
                        Some(Ok(SimMessage::StateChanged { state, action })) => {
                            AgentSignal::Progress(state.into_event(&agent, action, SignalSource::Push))
                        }
                        Some(Ok(SimMessage::AgentAction {
                            description,
                            progress,
                        })) => AgentSignal::Action {
                            description,
                            progress,
                        },
                        Some(Ok(SimMessage::Other)) => continue,
                        Some(Err(RaceError::Serialization(e))) => {
                            warn!(agent = %agent, error = %e, "malformed push message ignored");
                            continue;
                        }
                        Some(Err(e)) => {
                            let _ = signals
                                .send(AgentSignal::ChannelDown {
                                    reason: e.to_string(),
                                })
                                .await;
                            break;
                        }
                        None => {
                            let _ = signals
                                .send(AgentSignal::ChannelDown {
                                    reason: "channel closed".to_string(),
                                })
                                .await;
                            break;
                        }
                    };
                    if signals.send(signal).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(agent = %agent, error = %e, retry_in_ms = delay.as_millis() as u64, "subscribe failed");
            }
        }

        tokio::select! {
            _ = raised(&mut stop) => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = backoff.next(delay);
    }
}

/// Pull-based fallback producer.
pub async fn run_poller(
    agent: String,
    client: Arc<dyn SimulationClient>,
    signals: mpsc::Sender<AgentSignal>,
    mut stop: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; let the push channel lead.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = raised(&mut stop) => return,
            _ = ticker.tick() => {}
        }
        METRICS.inc_polls();
        match client.state().await {
            Ok(state) => {
                if let Some(steps) = state.steps {
                    if signals.send(AgentSignal::StepCount(steps)).await.is_err() {
                        return;
                    }
                }
                let event = state.into_event(&agent, None, SignalSource::Poll);
                if signals.send(AgentSignal::Progress(event)).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!(agent = %agent, error = %e, "poll failed"),
        }
    }
}

/// Agent name to live snapshot. The only structure shared across agents;
/// the lock is held for insert and lookup only.
#[derive(Clone, Default)]
pub struct AgentBoard {
    inner: Arc<RwLock<HashMap<String, watch::Receiver<AgentRun>>>>,
}

impl AgentBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: &str, snapshot: watch::Receiver<AgentRun>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(agent.to_string(), snapshot);
    }

    /// Latest snapshot of one agent.
    pub fn get(&self, agent: &str) -> Option<AgentRun> {
        let rx = {
            let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
            map.get(agent).cloned()
        };
        rx.map(|rx| rx.borrow().clone())
    }

    /// Latest snapshots of every agent, in registration order.
    pub fn snapshot(&self) -> Vec<AgentRun> {
        let receivers: Vec<watch::Receiver<AgentRun>> = {
            let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut runs: Vec<AgentRun> = receivers.iter().map(|rx| rx.borrow().clone()).collect();
        runs.sort_by_key(|r| r.registration);
        runs
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Endpoint, ScoreRecord};
    use crate::fakes::{action_msg, state_msg, terminal_msg, ScriptedClient};
    use serde_json::json;

    struct Rig {
        signals: mpsc::Sender<AgentSignal>,
        cancel: watch::Sender<bool>,
        completion: mpsc::Receiver<CompletionNotice>,
        handles: TrackerHandles,
        task: tokio::task::JoinHandle<AgentRun>,
    }

    fn rig(client: Arc<ScriptedClient>, duration: u32) -> Rig {
        let run = AgentRun::new("claude", "cli", client.endpoint().clone(), 0, 50);
        let (sig_tx, sig_rx) = mpsc::channel(64);
        let (cancel, cancel_rx) = watch::channel(false);
        let (done_tx, completion) = mpsc::channel(8);
        let (tracker, handles) = AgentTracker::new(run, duration, client, sig_rx, cancel_rx, done_tx);
        let task = tokio::spawn(tracker.with_final_fetch_timeout(Duration::from_millis(200)).run());
        Rig {
            signals: sig_tx,
            cancel,
            completion,
            handles,
            task,
        }
    }

    fn client() -> Arc<ScriptedClient> {
        Arc::new(ScriptedClient::new(Endpoint::new("127.0.0.1", 4100)))
    }

    fn progress(p: u32, metric: f64) -> AgentSignal {
        AgentSignal::Progress(ProgressEvent {
            agent: "claude".to_string(),
            progress: p,
            metric,
            action: None,
            terminal: false,
            score: None,
            source: SignalSource::Push,
        })
    }

    #[tokio::test]
    async fn duplicate_counters_replace_and_stale_events_are_dropped() {
        let mut r = rig(client(), 30);
        r.signals.send(AgentSignal::DriverStarted { pid: Some(1) }).await.unwrap();
        r.signals.send(progress(1, 500.0)).await.unwrap();
        r.signals.send(progress(2, 510.0)).await.unwrap();
        r.signals.send(progress(2, 495.0)).await.unwrap();
        r.signals
            .send(AgentSignal::Driver(DriverExit::Fatal {
                line: "authentication_error".to_string(),
            }))
            .await
            .unwrap();
        r.signals.send(progress(3, 9999.0)).await.unwrap();
        drop(r.signals);

        let run = r.task.await.unwrap();
        assert_eq!(run.status, AgentStatus::Failed);
        let pts: Vec<(u32, f64)> = run.series.points().iter().map(|p| (p.progress, p.value)).collect();
        assert_eq!(pts, vec![(1, 500.0), (2, 495.0)]);
        assert_eq!(run.progress, 2);

        let notice = r.completion.recv().await.unwrap();
        assert_eq!(notice.status, AgentStatus::Failed);
        assert!(*r.handles.stop.borrow());
    }

    #[tokio::test]
    async fn terminal_push_finishes_with_score_and_no_final_fetch() {
        let c = client();
        let mut r = rig(Arc::clone(&c), 30);
        r.signals.send(AgentSignal::DriverStarted { pid: None }).await.unwrap();
        let event = match terminal_msg(30, 1200.0, json!({"final_balance": 1200})) {
            SimMessage::StateChanged { state, action } => {
                state.into_event("claude", action, SignalSource::Push)
            }
            _ => unreachable!(),
        };
        r.signals.send(AgentSignal::Progress(event)).await.unwrap();

        let notice = r.completion.recv().await.unwrap();
        assert_eq!(notice.status, AgentStatus::Finished);
        drop(r.signals);
        let run = r.task.await.unwrap();
        assert_eq!(run.score, Some(ScoreRecord::Scalar { value: 1200.0 }));
        assert_eq!(c.state_queries(), 0);
    }

    #[tokio::test]
    async fn actions_publish_step_count() {
        let mut r = rig(client(), 30);
        for _ in 0..3 {
            r.signals
                .send(AgentSignal::Action {
                    description: "restock".to_string(),
                    progress: None,
                })
                .await
                .unwrap();
        }
        r.handles.steps.wait_for(|s| *s == 3).await.unwrap();
        let snap = r
            .handles
            .snapshot
            .wait_for(|run| run.steps == 3)
            .await
            .unwrap()
            .clone();
        assert_eq!(snap.actions.len(), 3);
        drop(r.signals);
        r.task.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_times_out_running_agent_and_keeps_history() {
        let mut r = rig(client(), 30);
        r.signals.send(AgentSignal::DriverStarted { pid: None }).await.unwrap();
        r.signals.send(progress(4, 640.0)).await.unwrap();
        r.handles
            .snapshot
            .wait_for(|run| run.progress == 4)
            .await
            .unwrap();

        r.cancel.send(true).unwrap();
        let notice = r.completion.recv().await.unwrap();
        assert_eq!(notice.status, AgentStatus::TimedOut);

        drop(r.signals);
        let run = r.task.await.unwrap();
        assert_eq!(run.reason().as_deref(), Some("race cancelled"));
        assert_eq!(run.series.points()[0].progress, 4);
    }

    #[tokio::test]
    async fn final_fetch_supplies_missing_score() {
        let c = client();
        c.set_state(crate::sim_client::SimState {
            progress: 12,
            metric: 700.0,
            terminal: false,
            score: Some(json!(700)),
            steps: None,
        });
        let r = rig(Arc::clone(&c), 30);
        r.signals.send(AgentSignal::DriverStarted { pid: None }).await.unwrap();
        r.signals
            .send(AgentSignal::Driver(DriverExit::StepBudget { steps: 5, max: 5 }))
            .await
            .unwrap();
        drop(r.signals);

        let run = r.task.await.unwrap();
        assert_eq!(run.status, AgentStatus::TimedOut);
        assert_eq!(run.latest_metric(), Some(700.0));
        assert_eq!(run.score, Some(ScoreRecord::Scalar { value: 700.0 }));
        assert_eq!(c.state_queries(), 1);
    }

    #[tokio::test]
    async fn event_channel_forwards_and_reconnects() {
        let c = client();
        c.push(state_msg(1, 510.0))
            .push(action_msg("set_price cola 1.25"))
            .disconnect()
            .push(state_msg(2, 520.0));

        let (tx, mut rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        let backoff = Backoff {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
        };
        let task = tokio::spawn(run_event_channel("claude".to_string(), c.clone(), tx, stop_rx, backoff));

        let mut seen = Vec::new();
        while seen.len() < 6 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen[0], AgentSignal::ChannelUp);
        assert!(matches!(seen[1], AgentSignal::Progress(ref e) if e.progress == 1));
        assert!(matches!(seen[2], AgentSignal::Action { .. }));
        assert!(matches!(seen[3], AgentSignal::ChannelDown { .. }));
        assert_eq!(seen[4], AgentSignal::ChannelUp);
        assert!(matches!(seen[5], AgentSignal::Progress(ref e) if e.progress == 2));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(c.subscriptions(), 2);
    }

    #[tokio::test]
    async fn poller_delivers_state_when_push_is_silent() {
        let c = client();
        c.refuse_subscribe().set_state(crate::sim_client::SimState {
            progress: 7,
            metric: 42.0,
            terminal: false,
            score: None,
            steps: None,
        });
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_poller(
            "claude".to_string(),
            c.clone(),
            tx,
            stop_rx,
            Duration::from_millis(10),
        ));

        match rx.recv().await.unwrap() {
            AgentSignal::Progress(e) => {
                assert_eq!(e.progress, 7);
                assert_eq!(e.source, SignalSource::Poll);
            }
            other => panic!("unexpected {other:?}"),
        }
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn poller_forwards_instance_step_count() {
        let c = client();
        c.refuse_subscribe().set_state(crate::sim_client::SimState {
            progress: 3,
            metric: 10.0,
            terminal: false,
            score: None,
            steps: Some(4),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_poller(
            "claude".to_string(),
            c.clone(),
            tx,
            stop_rx,
            Duration::from_millis(10),
        ));

        assert_eq!(rx.recv().await.unwrap(), AgentSignal::StepCount(4));
        assert!(matches!(rx.recv().await.unwrap(), AgentSignal::Progress(ref e) if e.progress == 3));
        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn polled_step_count_raises_but_never_lowers_steps() {
        let mut r = rig(client(), 30);
        r.signals.send(AgentSignal::DriverStarted { pid: None }).await.unwrap();
        r.signals
            .send(AgentSignal::Action {
                description: "restock".to_string(),
                progress: None,
            })
            .await
            .unwrap();
        r.signals.send(AgentSignal::StepCount(6)).await.unwrap();
        r.signals.send(AgentSignal::StepCount(2)).await.unwrap();
        r.handles.steps.wait_for(|s| *s == 6).await.unwrap();

        drop(r.signals);
        let run = r.task.await.unwrap();
        assert_eq!(run.steps, 6);
        assert_eq!(run.actions.entries().count(), 1);
    }

    #[tokio::test]
    async fn board_lists_in_registration_order() {
        let board = AgentBoard::new();
        let (_b_tx, b_rx) = watch::channel(AgentRun::new("b", "cli", Endpoint::new("h", 2), 1, 5));
        let (_a_tx, a_rx) = watch::channel(AgentRun::new("a", "cli", Endpoint::new("h", 1), 0, 5));
        board.insert("b", b_rx);
        board.insert("a", a_rx);

        let names: Vec<String> = board.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(board.get("b").unwrap().registration, 1);
        assert!(board.get("zed").is_none());
    }
}
