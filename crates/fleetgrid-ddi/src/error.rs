//! Gateway error types.

use fleet_core::ErrorKind;
use fleetgrid_deploy::DeployError;
use fleetgrid_state::{ActionId, DistributionSetId, StateError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DdiError {
    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("action not found: {0}")]
    ActionNotFound(ActionId),

    #[error("action {0} has not been installed")]
    NotInstalled(ActionId),

    #[error("distribution set not found: {0}")]
    DistributionSetNotFound(DistributionSetId),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl DdiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DdiError::TargetNotFound(_)
            | DdiError::ActionNotFound(_)
            | DdiError::NotInstalled(_)
            | DdiError::DistributionSetNotFound(_) => ErrorKind::NotFound,
            DdiError::Malformed(_) => ErrorKind::Malformed,
            DdiError::Deploy(e) => e.kind(),
            DdiError::State(_) => ErrorKind::Internal,
        }
    }
}

pub type DdiResult<T> = Result<T, DdiError>;
