use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("insufficient analyzer coverage: present weight mass {present_mass:.2} below required {required:.2}")]
    InsufficientCoverage { present_mass: f64, required: f64 },

    #[error("decision already logged for {instrument} at {as_of}; supersede it first")]
    DuplicateDecision {
        instrument: String,
        as_of: DateTime<Utc>,
    },

    #[error("weight invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Wrap a storage-layer failure. Keeps sqlx out of this crate's API.
    pub fn db(err: impl std::fmt::Display) -> Self {
        EngineError::Database(err.to_string())
    }
}
