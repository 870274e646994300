//! Rollout error types.

use fleet_core::ErrorKind;
use fleetgrid_state::{DistributionSetId, RolloutId, RolloutStatus};
use thiserror::Error;

/// Errors that can occur while creating or progressing rollouts.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("rollout not found: {0}")]
    NotFound(RolloutId),

    #[error("distribution set not found: {0}")]
    DistributionSetNotFound(DistributionSetId),

    #[error("invalid rollout definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid target filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("invalid condition expression '{expression}': {reason}")]
    InvalidCondition { expression: String, reason: String },

    #[error("cannot {operation} rollout {id} in status {status:?}")]
    InvalidTransition {
        id: RolloutId,
        status: RolloutStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Deploy(#[from] fleetgrid_deploy::DeployError),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

impl RolloutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RolloutError::NotFound(_) | RolloutError::DistributionSetNotFound(_) => {
                ErrorKind::NotFound
            }
            RolloutError::InvalidDefinition(_)
            | RolloutError::InvalidFilter { .. }
            | RolloutError::InvalidCondition { .. } => ErrorKind::Malformed,
            RolloutError::InvalidTransition { .. } => ErrorKind::Conflict,
            RolloutError::Deploy(e) => e.kind(),
            RolloutError::State(_) => ErrorKind::Internal,
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;
