//! Dripline error types.

use thiserror::Error;

/// Result alias used across all Dripline crates.
pub type Result<T> = std::result::Result<T, DriplineError>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum DriplineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rollback artifact error: {0}")]
    Artifact(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Lead error: {0}")]
    Lead(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DriplineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn db(msg: impl std::fmt::Display) -> Self {
        Self::Database(msg.to_string())
    }

    /// Recoverable errors are reported back to the caller with no state change.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transition(_) | Self::Validation(_))
    }
}

/// Invalid instance lifecycle transition. Never fatal: the caller surfaces
/// the message and nothing is written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("instance {id} is {status}, only paused instances can be resumed")]
    NotPaused { id: String, status: String },

    #[error("instance {id} is {status}, only active instances can be paused")]
    NotActive { id: String, status: String },

    #[error("instance {id} is already {status}")]
    AlreadyTerminal { id: String, status: String },

    #[error("sequence {id} is inactive")]
    SequenceInactive { id: String },
}
