//! Deployment error types.

use fleet_core::ErrorKind;
use fleetgrid_state::{ActionId, DistributionSetId, Status};
use thiserror::Error;

/// Errors that can occur while assigning, canceling or reporting on actions.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("target already exists: {0}")]
    TargetExists(String),

    #[error("action not found: {0}")]
    ActionNotFound(ActionId),

    #[error("distribution set not found: {0}")]
    DistributionSetNotFound(DistributionSetId),

    #[error("action {action_id} is closed ({status:?})")]
    ActionClosed { action_id: ActionId, status: Status },

    #[error("action {action_id} reached the limit of {limit} status entries")]
    TooManyStatusEntries { action_id: ActionId, limit: u32 },

    #[error("feedback carries {count} messages, limit is {limit}")]
    TooManyMessages { count: usize, limit: u32 },

    #[error("invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("invalid maintenance window: {0}")]
    InvalidMaintenanceWindow(#[from] fleetgrid_maintenance::WindowError),

    #[error("action {0} cannot be canceled in its current state")]
    NotCancelable(ActionId),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::TargetNotFound(_)
            | DeployError::ActionNotFound(_)
            | DeployError::DistributionSetNotFound(_) => ErrorKind::NotFound,
            DeployError::ActionClosed { .. } => ErrorKind::Gone,
            DeployError::TooManyStatusEntries { .. } | DeployError::TooManyMessages { .. } => {
                ErrorKind::QuotaExceeded
            }
            DeployError::InvalidAssignment(_) | DeployError::InvalidMaintenanceWindow(_) => {
                ErrorKind::Malformed
            }
            DeployError::TargetExists(_) | DeployError::NotCancelable(_) => ErrorKind::Conflict,
            DeployError::State(_) => ErrorKind::Internal,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;
