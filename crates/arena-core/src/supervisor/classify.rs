//! Pattern-based classification of driver output lines.

use regex::{RegexSet, RegexSetBuilder};

use crate::config::ClassifierConfig;
use crate::domain::{RaceError, Result};

/// What a single output line means for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Info,
    /// Transient vendor error; logged only.
    Recoverable,
    /// Unrecoverable; the driver is terminated and the run fails.
    Fatal,
    /// Looks like an error but matches no known pattern. Logged so the
    /// pattern list can be extended; otherwise treated as `Info`.
    Unclassified,
}

#[derive(Debug, Clone)]
pub struct OutputClassifier {
    fatal: RegexSet,
    recoverable: RegexSet,
    error_hints: RegexSet,
}

fn build(patterns: &[String]) -> Result<RegexSet> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|e| RaceError::InvalidConfig(format!("classifier pattern: {e}")))
}

impl OutputClassifier {
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        Ok(Self {
            fatal: build(&config.fatal)?,
            recoverable: build(&config.recoverable)?,
            error_hints: build(&config.error_hints)?,
        })
    }

    /// Fatal patterns are checked first so a line matching both lists
    /// fails the run.
    pub fn classify(&self, line: &str) -> LineClass {
        let line = line.trim();
        if self.fatal.is_match(line) {
            LineClass::Fatal
        } else if self.recoverable.is_match(line) {
            LineClass::Recoverable
        } else if self.error_hints.is_match(line) {
            LineClass::Unclassified
        } else {
            LineClass::Info
        }
    }
}
