//! Domain-level error taxonomy for the race engine.

/// Errors produced while interpreting a raw score payload.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScoreError {
    #[error("score payload has no recognised shape: {payload}")]
    UnrecognisedShape { payload: String },

    #[error("score field {field} is not a finite number")]
    NotANumber { field: String },

    #[error("dimension {dimension} score {score} outside 0..=100")]
    DimensionOutOfRange { dimension: String, score: f64 },
}

/// Race engine errors.
#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("invalid race config: {0}")]
    InvalidConfig(String),

    #[error("provisioning failed for agent {agent}: {reason}")]
    Provisioning { agent: String, reason: String },

    #[error("simulation request to {endpoint} failed: {reason}")]
    Simulation { endpoint: String, reason: String },

    #[error("event channel for {endpoint} failed: {reason}")]
    Channel { endpoint: String, reason: String },

    #[error("agent not registered in race: {0}")]
    UnknownAgent(String),

    #[error("duplicate result for agent {0}")]
    DuplicateResult(String),

    #[error("race {0} is already finalized")]
    RaceFinalized(uuid::Uuid),

    #[error("race {race_id} has agents without a terminal status: {pending:?}")]
    RaceIncomplete {
        race_id: uuid::Uuid,
        pending: Vec<String>,
    },

    #[error("invalid status transition for {agent}: {from} -> {to}")]
    InvalidTransition {
        agent: String,
        from: String,
        to: String,
    },

    #[error("race task failed: {0}")]
    Task(String),

    #[error("score error: {0}")]
    Score(#[from] ScoreError),

    #[error("storage error: {0}")]
    Storage(#[from] arena_store::StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for race engine operations.
pub type Result<T> = std::result::Result<T, RaceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_error_names_agent() {
        let err = RaceError::Provisioning {
            agent: "claude".to_string(),
            reason: "not ready after 5s".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("claude"));
        assert!(msg.contains("not ready after 5s"));
    }

    #[test]
    fn score_error_converts() {
        let err: RaceError = ScoreError::NotANumber {
            field: "composite_score".to_string(),
        }
        .into();
        assert!(err.to_string().contains("composite_score"));
    }

    #[test]
    fn storage_error_converts() {
        let err: RaceError = arena_store::StorageError::NotFound {
            race_id: "r-9".to_string(),
        }
        .into();
        assert!(err.to_string().contains("storage error"));
        assert!(err.to_string().contains("r-9"));
    }
}
