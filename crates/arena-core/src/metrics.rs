//! Global atomic counters for race observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a race).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    events_ingested: AtomicU64,
    stale_events: AtomicU64,
    corrections: AtomicU64,
    channel_reconnects: AtomicU64,
    polls: AtomicU64,
    recoverable_errors: AtomicU64,
    unclassified_lines: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_ingested: AtomicU64::new(0),
            stale_events: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
            channel_reconnects: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            recoverable_errors: AtomicU64::new(0),
            unclassified_lines: AtomicU64::new(0),
        }
    }

    counter!(inc_events_ingested, events_ingested, events_ingested);
    counter!(inc_stale_events, stale_events, stale_events);
    counter!(inc_corrections, corrections, corrections);
    counter!(inc_channel_reconnects, channel_reconnects, channel_reconnects);
    counter!(inc_polls, polls, polls);
    counter!(inc_recoverable_errors, recoverable_errors, recoverable_errors);
    counter!(inc_unclassified_lines, unclassified_lines, unclassified_lines);

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a race) rather than on every
    /// increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_ingested = self.events_ingested(),
            stale_events = self.stale_events(),
            corrections = self.corrections(),
            channel_reconnects = self.channel_reconnects(),
            polls = self.polls(),
            recoverable_errors = self.recoverable_errors(),
            unclassified_lines = self.unclassified_lines(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.events_ingested,
            &self.stale_events,
            &self.corrections,
            &self.channel_reconnects,
            &self.polls,
            &self.recoverable_errors,
            &self.unclassified_lines,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}
