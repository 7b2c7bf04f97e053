//! State and store error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// Object missing, possibly due to eventual consistency; retryable
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    /// Store temporarily unavailable; retryable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Write rejected by a concurrent modification
    #[error("conflict writing {kind} {name:?}")]
    Conflict { kind: &'static str, name: String },
}

impl StateError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        StateError::NotFound { kind, name: name.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::NotFound { .. } | StateError::Unavailable(_))
    }
}
