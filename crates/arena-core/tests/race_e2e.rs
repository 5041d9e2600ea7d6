//! End-to-end races against scripted simulation instances.
//!
//! Simulation instances are faked at the client seam; agent drivers are real
//! `sh` processes so supervision, output classification and caps run for
//! real.

use std::sync::Arc;
use std::time::Duration;

use arena_core::fakes::{action_msg, state_msg, terminal_msg, FakeLauncher, ScriptedClientFactory};
use arena_core::{
    AgentStatus, ClientFactory, Endpoint, RaceConfig, RaceDeps, RaceHistory, RaceOrchestrator,
    ScoreScheme, SimState, SimulationLauncher,
};
use arena_store::fakes::MemoryRaceRecordStore;
use serde_json::json;

const BASE_PORT: u16 = 4500;

struct Agent {
    name: &'static str,
    script: &'static str,
}

fn config(agents: &[Agent], limits: &str) -> RaceConfig {
    let mut text = format!(
        r#"
scenario_id = "vending"
seed = 1234
duration = 30
instructions = "Run the vending machine for 30 days."

[params]
starting_balance = "500"

[simulation]
command = ["sim", "--port", "{{port}}", "--seed", "{{seed}}"]
base_port = {BASE_PORT}
startup_timeout_ms = 500
probe_interval_ms = 5
request_timeout_ms = 200

[limits]
poll_interval_ms = 50
reconnect_initial_ms = 10
reconnect_max_ms = 50
drain_timeout_ms = 100
{limits}
"#
    );
    for agent in agents {
        text.push_str(&format!(
            "\n[[agents]]\nname = \"{}\"\nkind = \"sh\"\ncommand = [\"sh\", \"-c\", {:?}]\n",
            agent.name, agent.script
        ));
    }
    RaceConfig::from_toml_str(&text).expect("valid test config")
}

fn endpoint(ordinal: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", BASE_PORT + ordinal)
}

fn deps(clients: &Arc<ScriptedClientFactory>) -> RaceDeps {
    RaceDeps {
        launcher: Arc::new(FakeLauncher::new()) as Arc<dyn SimulationLauncher>,
        clients: Arc::clone(clients) as Arc<dyn ClientFactory>,
        history: None,
    }
}

#[tokio::test]
async fn higher_final_score_wins() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients
        .script(endpoint(0))
        .push(state_msg(10, 700.0))
        .push(state_msg(20, 950.0))
        .push(terminal_msg(30, 1200.0, json!({"score": 1200.0})));
    clients
        .script(endpoint(1))
        .push(state_msg(10, 600.0))
        .push(state_msg(20, 700.0))
        .push(terminal_msg(30, 800.0, json!({"score": 800.0})));

    let record = RaceOrchestrator::new(
        config(
            &[
                Agent { name: "claude", script: "sleep 10" },
                Agent { name: "codex", script: "sleep 10" },
            ],
            "",
        ),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    assert_eq!(record.meta.seed, 1234);
    assert_eq!(record.meta.agents.len(), 2);
    let ranked: Vec<&str> = record.entries.iter().map(|e| e.agent.as_str()).collect();
    assert_eq!(ranked, vec!["claude", "codex"]);
    for entry in &record.entries {
        assert_eq!(entry.status, AgentStatus::Finished);
        assert_eq!(entry.scheme, ScoreScheme::Scalar);
        assert_eq!(entry.progress, 30);
        assert!(entry.reason.is_none());
    }
    assert_eq!(record.entries[0].value, Some(1200.0));

    let claude = record.run("claude").unwrap();
    let metrics: Vec<f64> = claude.series.points().iter().map(|p| p.value).collect();
    assert_eq!(metrics, vec![700.0, 950.0, 1200.0]);
}

#[tokio::test]
async fn auth_failure_fails_one_agent_without_aborting_the_race() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients
        .script(endpoint(0))
        .push(state_msg(5, 300.0))
        .push(state_msg(15, 500.0))
        .push(terminal_msg(30, 900.0, json!({"score": 900.0})));
    clients
        .script(endpoint(1))
        .step_delay(Duration::from_millis(50))
        .push(state_msg(5, 9000.0));

    let record = RaceOrchestrator::new(
        config(
            &[
                Agent { name: "steady", script: "sleep 10" },
                Agent {
                    name: "locked-out",
                    script: "sleep 0.3; echo 'API Error: 401 {\"type\":\"authentication_error\"}'; sleep 10",
                },
            ],
            "",
        ),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    assert_eq!(record.winner().unwrap().agent, "steady");
    let failed = record.entry("locked-out").unwrap();
    assert_eq!(failed.rank, 2);
    assert_eq!(failed.status, AgentStatus::Failed);
    assert!(failed.reason.as_deref().unwrap().contains("authentication_error"));
    // History up to the failure is kept.
    assert_eq!(failed.final_metric, Some(9000.0));
}

#[tokio::test]
async fn step_budget_times_out_and_keeps_partial_history() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients
        .script(endpoint(0))
        .push(state_msg(1, 510.0))
        .push(action_msg("restock cola"))
        .push(state_msg(2, 525.0))
        .push(action_msg("raise prices"))
        .push(action_msg("restock chips"));

    let record = RaceOrchestrator::new(
        config(&[Agent { name: "busy", script: "sleep 10" }], "max_steps = 3"),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let entry = record.entry("busy").unwrap();
    assert_eq!(entry.status, AgentStatus::TimedOut);
    assert_eq!(entry.steps, 3);
    assert!(entry.reason.as_deref().unwrap().contains("step budget"));
    assert_eq!(entry.final_metric, Some(525.0));
    assert_eq!(entry.scheme, ScoreScheme::Unscored);

    let run = record.run("busy").unwrap();
    let logged: Vec<&str> = run.actions.entries().map(|a| a.description.as_str()).collect();
    assert_eq!(logged, vec!["restock cola", "raise prices", "restock chips"]);
}

#[tokio::test]
async fn wall_clock_cap_kills_a_silent_driver() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients.script(endpoint(0)).push(state_msg(4, 420.0));

    let record = RaceOrchestrator::new(
        config(&[Agent { name: "idle", script: "sleep 30" }], "wall_clock_secs = 1"),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let entry = record.entry("idle").unwrap();
    assert_eq!(entry.status, AgentStatus::TimedOut);
    assert!(entry.reason.as_deref().unwrap().contains("wall-clock"));
    assert_eq!(entry.progress, 4);
}

#[tokio::test]
async fn polling_covers_a_dead_push_channel() {
    let clients = Arc::new(ScriptedClientFactory::new());
    let silent = clients.script(endpoint(0));
    silent.refuse_subscribe().set_state(SimState {
        progress: 30,
        metric: 640.0,
        terminal: true,
        score: Some(json!({"score": 640.0})),
        steps: None,
    });

    let record = RaceOrchestrator::new(
        config(&[Agent { name: "quiet", script: "sleep 10" }], ""),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let entry = record.entry("quiet").unwrap();
    assert_eq!(entry.status, AgentStatus::Finished);
    assert_eq!(entry.value, Some(640.0));
    assert!(silent.state_queries() >= 1);
    assert!(!record.run("quiet").unwrap().channel_seen);
}

#[tokio::test]
async fn dropped_channel_reconnects_and_the_race_still_finishes() {
    let clients = Arc::new(ScriptedClientFactory::new());
    let flaky = clients.script(endpoint(0));
    flaky
        .push(state_msg(10, 100.0))
        .disconnect()
        .push(state_msg(20, 200.0))
        .push(terminal_msg(30, 300.0, json!({"score": 300.0})));

    let record = RaceOrchestrator::new(
        config(&[Agent { name: "flaky", script: "sleep 10" }], ""),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let run = record.run("flaky").unwrap();
    assert_eq!(run.status, AgentStatus::Finished);
    assert_eq!(run.reconnects, 1);
    assert_eq!(run.series.len(), 3);
    assert!(flaky.subscriptions() >= 2);
}

#[tokio::test]
async fn clean_driver_exit_finishes_with_the_final_state() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients.script(endpoint(0)).set_state(SimState {
        progress: 12,
        metric: 480.0,
        terminal: false,
        score: Some(json!({"score": 480.0})),
        steps: None,
    });

    let record = RaceOrchestrator::new(
        config(&[Agent { name: "done-early", script: "sleep 0.3; echo 'all done'" }], ""),
        deps(&clients),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let entry = record.entry("done-early").unwrap();
    assert_eq!(entry.status, AgentStatus::Finished);
    assert_eq!(entry.progress, 12);
    assert_eq!(entry.value, Some(480.0));
}

#[tokio::test]
async fn status_is_queryable_while_running_and_cancel_settles_everyone() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients.script(endpoint(0)).push(state_msg(7, 700.0));
    clients.script(endpoint(1)).push(state_msg(3, 300.0));

    let handle = RaceOrchestrator::new(
        config(
            &[
                Agent { name: "a", script: "sleep 30" },
                Agent { name: "b", script: "sleep 30" },
            ],
            "",
        ),
        deps(&clients),
    )
    .unwrap()
    .start()
    .await
    .unwrap();

    let mut status = handle.status();
    for _ in 0..200 {
        if status
            .agents
            .iter()
            .all(|r| r.progress > 0 && r.status == AgentStatus::Running)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        status = handle.status();
    }
    assert_eq!(status.agents.len(), 2);
    assert_eq!(status.agents[0].name, "a");
    assert_eq!(status.agents[0].latest_metric(), Some(700.0));
    assert_eq!(status.agents[1].progress, 3);
    assert!(status.agents.iter().all(|r| r.status == AgentStatus::Running));
    assert!(!status.complete);

    handle.monitor().cancel();
    let record = handle.wait().await.unwrap();

    assert!(record.cancelled);
    assert_eq!(record.entries.len(), 2);
    for entry in &record.entries {
        assert_eq!(entry.status, AgentStatus::TimedOut);
        assert_eq!(entry.reason.as_deref(), Some("race cancelled"));
    }
    // Unscored, so ranked by last metric.
    assert_eq!(record.winner().unwrap().agent, "a");
}

#[tokio::test]
async fn finished_race_is_persisted_to_history() {
    let clients = Arc::new(ScriptedClientFactory::new());
    clients
        .script(endpoint(0))
        .push(terminal_msg(30, 1000.0, json!({"score": 1000.0})));
    let history = RaceHistory::new(Arc::new(MemoryRaceRecordStore::new()));

    let record = RaceOrchestrator::new(
        config(&[Agent { name: "solo", script: "sleep 10" }], ""),
        deps(&clients).with_history(history.clone()),
    )
    .unwrap()
    .run()
    .await
    .unwrap();

    let listed = history.list(Some("vending")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].agents, vec!["solo"]);

    let loaded = history.load(&record.meta.race_id.to_string()).await.unwrap();
    assert_eq!(loaded, record);
}
