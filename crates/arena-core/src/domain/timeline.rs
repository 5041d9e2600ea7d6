//! Per-agent timeline structures: the primary metric series and the bounded
//! recent-action log.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of actions retained per agent.
pub const DEFAULT_ACTION_LOG_CAPACITY: usize = 50;

/// One sample of the primary metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    pub progress: u32,
    pub value: f64,
}

/// How a sample changed the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesUpdate {
    /// New progress counter; a point was appended.
    Appended,
    /// Same counter as the latest point; its value was replaced.
    Replaced,
    /// Counter older than the latest point; the latest value was overwritten.
    Corrected,
}

/// Primary metric history with non-decreasing progress counters.
///
/// There is at most one point per counter, so the series never grows past
/// the number of distinct progress values a simulation reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MetricSeries {
    points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample.
    pub fn record(&mut self, progress: u32, value: f64) -> SeriesUpdate {
        match self.points.last_mut() {
            Some(last) if progress == last.progress => {
                last.value = value;
                SeriesUpdate::Replaced
            }
            Some(last) if progress < last.progress => {
                last.value = value;
                SeriesUpdate::Corrected
            }
            _ => {
                self.points.push(MetricPoint { progress, value });
                SeriesUpdate::Appended
            }
        }
    }

    pub fn points(&self) -> &[MetricPoint] {
        &self.points
    }

    pub fn latest(&self) -> Option<MetricPoint> {
        self.points.last().copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One action an agent took against its simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionEntry {
    /// Progress counter at the time the action was observed.
    pub progress: u32,
    pub description: String,
    pub observed_at: DateTime<Utc>,
}

/// Ring buffer of the most recent actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionLog {
    capacity: usize,
    entries: VecDeque<ActionEntry>,
    /// Entries evicted because the log was full.
    dropped: u64,
}

impl ActionLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Push an entry, evicting the oldest when full.
    pub fn push(&mut self, entry: ActionEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(entry);
    }

    /// Entries oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &ActionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ActionLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ACTION_LOG_CAPACITY)
    }
}
