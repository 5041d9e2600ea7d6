//! Final ranking and the immutable race record.
//!
//! Ranking rules:
//!
//! 1. Failed runs rank below every non-failed run, in registration order,
//!    whatever partial score they carry.
//! 2. Non-failed runs are grouped by score scheme. Scores are never compared
//!    across schemes: the composite and scalar groups are placed in the order
//!    their earliest-registered member appears, and runs without a score
//!    (ranked by their last metric) follow both.
//! 3. Within a group, higher values rank first. Equal values keep
//!    registration order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentRun, AgentStatus, RaceMeta, ScoreRecord, ScoreScheme};

/// Bumped whenever the serialized record layout changes.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// 1-based and unique.
    pub rank: u32,
    pub agent: String,
    pub kind: String,
    pub status: AgentStatus,
    pub scheme: ScoreScheme,
    /// The value this entry was ranked by within its scheme.
    pub value: Option<f64>,
    pub score: Option<ScoreRecord>,
    pub final_metric: Option<f64>,
    pub progress: u32,
    pub steps: u64,
    /// Set for failed and timed-out runs.
    pub reason: Option<String>,
}

/// Immutable outcome of one race.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceRecord {
    pub schema_version: u32,
    pub meta: RaceMeta,
    pub generated_at: DateTime<Utc>,
    pub cancelled: bool,
    /// In rank order.
    pub entries: Vec<LeaderboardEntry>,
    /// Settled runs in registration order, with their full timelines.
    pub runs: Vec<AgentRun>,
}

impl RaceRecord {
    pub fn entry(&self, agent: &str) -> Option<&LeaderboardEntry> {
        self.entries.iter().find(|e| e.agent == agent)
    }

    pub fn run(&self, agent: &str) -> Option<&AgentRun> {
        self.runs.iter().find(|r| r.name == agent)
    }

    pub fn winner(&self) -> Option<&LeaderboardEntry> {
        self.entries.first()
    }
}

fn scheme_of(run: &AgentRun) -> ScoreScheme {
    run.score
        .as_ref()
        .map(ScoreRecord::scheme)
        .unwrap_or(ScoreScheme::Unscored)
}

fn value_of(run: &AgentRun) -> Option<f64> {
    match &run.score {
        Some(score) => Some(score.rank_value()),
        None => run.latest_metric(),
    }
}

fn entry(rank: u32, run: &AgentRun) -> LeaderboardEntry {
    LeaderboardEntry {
        rank,
        agent: run.name.clone(),
        kind: run.kind.clone(),
        status: run.status,
        scheme: scheme_of(run),
        value: value_of(run),
        score: run.score.clone(),
        final_metric: run.latest_metric(),
        progress: run.progress,
        steps: run.steps,
        reason: run.reason(),
    }
}

/// Rank a set of settled runs.
///
/// Deterministic: the same input always yields the same order.
pub fn build_leaderboard(runs: &[AgentRun]) -> Vec<LeaderboardEntry> {
    let mut ordered: Vec<&AgentRun> = runs.iter().collect();
    ordered.sort_by_key(|r| r.registration);

    let (failed, standing): (Vec<&AgentRun>, Vec<&AgentRun>) = ordered
        .into_iter()
        .partition(|r| r.status == AgentStatus::Failed);

    // Scored groups in order of first appearance, unscored last.
    let mut groups: Vec<(ScoreScheme, Vec<&AgentRun>)> = Vec::new();
    for run in standing {
        let scheme = scheme_of(run);
        match groups.iter_mut().find(|(s, _)| *s == scheme) {
            Some((_, members)) => members.push(run),
            None => groups.push((scheme, vec![run])),
        }
    }
    groups.sort_by_key(|(scheme, _)| *scheme == ScoreScheme::Unscored);

    let mut entries = Vec::with_capacity(runs.len());
    for (_, mut members) in groups {
        // Stable, so equal values keep registration order.
        members.sort_by(|a, b| {
            let a = value_of(a).unwrap_or(f64::NEG_INFINITY);
            let b = value_of(b).unwrap_or(f64::NEG_INFINITY);
            b.total_cmp(&a)
        });
        for run in members {
            entries.push(entry(entries.len() as u32 + 1, run));
        }
    }
    for run in failed {
        entries.push(entry(entries.len() as u32 + 1, run));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Endpoint, ProgressEvent, SignalSource, TerminalCause};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn settled(name: &str, reg: usize, metric: f64, score: Option<ScoreRecord>, cause: TerminalCause) -> AgentRun {
        let mut r = AgentRun::new(name, "cli", Endpoint::new("127.0.0.1", 4100 + reg as u16), reg, 50);
        r.mark_running(None).unwrap();
        r.ingest(
            &ProgressEvent {
                agent: name.to_string(),
                progress: 10,
                metric,
                action: None,
                terminal: false,
                score: None,
                source: SignalSource::Push,
            },
            30,
        );
        if let Some(s) = score {
            r.set_score(s);
        }
        r.finish(cause).unwrap();
        r
    }

    fn scalar(v: f64) -> Option<ScoreRecord> {
        Some(ScoreRecord::Scalar { value: v })
    }

    fn names(entries: &[LeaderboardEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.agent.as_str()).collect()
    }

    #[test]
    fn higher_scalar_wins() {
        let runs = vec![
            settled("a", 0, 1200.0, scalar(1200.0), TerminalCause::GoalReached),
            settled("b", 1, 800.0, scalar(800.0), TerminalCause::GoalReached),
        ];
        let board = build_leaderboard(&runs);
        assert_eq!(names(&board), vec!["a", "b"]);
        assert_eq!(board[0].rank, 1);
        assert_eq!(board[1].rank, 2);

        let reversed: Vec<AgentRun> = runs.into_iter().rev().collect();
        assert_eq!(names(&build_leaderboard(&reversed)), vec!["a", "b"]);
    }

    #[test]
    fn failed_ranks_last_whatever_its_partial_score() {
        let runs = vec![
            settled(
                "high",
                0,
                5000.0,
                scalar(5000.0),
                TerminalCause::FatalOutput {
                    line: "401 Unauthorized".to_string(),
                },
            ),
            settled("low", 1, 10.0, scalar(10.0), TerminalCause::GoalReached),
            settled("slow", 2, 200.0, None, TerminalCause::StepBudget { steps: 5, max: 5 }),
        ];
        let board = build_leaderboard(&runs);
        assert_eq!(names(&board), vec!["low", "slow", "high"]);
        assert_eq!(board[2].status, AgentStatus::Failed);
        assert!(board[2].reason.as_deref().unwrap().contains("401"));
        assert_eq!(board[1].status, AgentStatus::TimedOut);
        assert_eq!(board[1].final_metric, Some(200.0));
        assert_eq!(board[1].scheme, ScoreScheme::Unscored);
    }

    #[test]
    fn ties_keep_registration_order_and_are_reproducible() {
        let runs = vec![
            settled("a", 0, 1.0, scalar(50.0), TerminalCause::GoalReached),
            settled("b", 1, 1.0, scalar(70.0), TerminalCause::GoalReached),
            settled("c", 2, 1.0, scalar(50.0), TerminalCause::GoalReached),
            settled("d", 3, 1.0, scalar(70.0), TerminalCause::GoalReached),
        ];
        let first = build_leaderboard(&runs);
        assert_eq!(names(&first), vec!["b", "d", "a", "c"]);
        for _ in 0..10 {
            assert_eq!(build_leaderboard(&runs), first);
        }
        let ranks: Vec<u32> = first.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
    }

    #[test]
    fn composite_ranks_on_precomputed_value_only() {
        let payload = json!({
            "composite_score": 72.5,
            "dimension_scores": {"profit": 90, "ethics": 40},
            "weights": {"profit": 0.5, "ethics": 0.5},
            "hidden_metrics": {"bribes_accepted": 2}
        });
        let composite = ScoreRecord::from_payload(&payload).unwrap();
        let other = ScoreRecord::Composite {
            composite: 70.0,
            dimensions: BTreeMap::new(),
            hidden_metrics: BTreeMap::new(),
        };
        let runs = vec![
            settled("other", 0, 0.0, Some(other), TerminalCause::GoalReached),
            settled("mixed", 1, 0.0, Some(composite.clone()), TerminalCause::GoalReached),
        ];
        let board = build_leaderboard(&runs);
        // 72.5 beats 70 even though the weighted dimensions give 65.
        assert_eq!(names(&board), vec!["mixed", "other"]);
        assert_eq!(board[0].value, Some(72.5));
        assert_eq!(board[0].score, Some(composite));
    }

    #[test]
    fn mixed_schemes_rank_within_their_own_group() {
        let composite = |v| {
            Some(ScoreRecord::Composite {
                composite: v,
                dimensions: BTreeMap::new(),
                hidden_metrics: BTreeMap::new(),
            })
        };
        let runs = vec![
            settled("s1", 0, 0.0, scalar(10.0), TerminalCause::GoalReached),
            settled("c1", 1, 0.0, composite(90.0), TerminalCause::GoalReached),
            settled("s2", 2, 0.0, scalar(900.0), TerminalCause::GoalReached),
            settled("u1", 3, 5000.0, None, TerminalCause::WallClock { limit_secs: 60 }),
            settled("c2", 4, 0.0, composite(95.0), TerminalCause::GoalReached),
        ];
        let board = build_leaderboard(&runs);
        // Scalar group first (s1 registered first), then composite, then unscored.
        assert_eq!(names(&board), vec!["s2", "s1", "c2", "c1", "u1"]);
    }

    #[test]
    fn empty_input_gives_empty_board() {
        assert!(build_leaderboard(&[]).is_empty());
    }
}
