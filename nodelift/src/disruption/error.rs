//! Disruption error taxonomy

use crate::provider::ProviderError;
use crate::provisioning::ProvisionError;
use crate::state::StateError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DisruptionError>;

#[derive(Debug, Error)]
pub enum DisruptionError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// A candidate began deletion between selection and simulation; the
    /// caller skips it and moves on
    #[error("candidate is already being deleted")]
    CandidateDeleting,

    /// Re-simulation disagreed with the planner; the command is abandoned
    /// and the next tick starts fresh
    #[error("validation failed: {0}")]
    Validation(String),

    /// A second command tried to claim a candidate already in the queue
    #[error("candidate {0} is already being disrupted")]
    DuplicateCandidate(String),

    /// Tainting failed everywhere and the command needed replacements
    #[error("tainting candidates failed: {0}")]
    Taint(String),

    /// The cloud provider refused to create a replacement
    #[error("launching replacement: {0}")]
    Launch(String),
}

impl DisruptionError {
    pub fn is_validation(&self) -> bool {
        matches!(self, DisruptionError::Validation(_))
    }
}
