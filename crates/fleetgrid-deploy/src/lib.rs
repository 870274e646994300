//! fleetgrid-deploy — the action lifecycle.
//!
//! An [`Action`](fleetgrid_state::Action) is either a deployment of a
//! distribution set to a target or a request to cancel such a deployment.
//! Device feedback drives actions through their states via the pure
//! [`machine::apply`] function, which returns the updated action together
//! with the [`DomainEvent`]s the change implies. [`DeploymentManager`] runs
//! those transitions inside store transactions and applies the events to
//! the target record.

pub mod assign;
pub mod error;
pub mod feedback;
pub mod machine;
pub mod manager;

pub use assign::{AssignOutcome, AssignmentRequest, MAX_WEIGHT};
pub use error::{DeployError, DeployResult};
pub use feedback::{Execution, Feedback, FinishedResult, Progress};
pub use machine::{DomainEvent, Transition};
pub use manager::{ConfigDataMode, DeploymentManager, FeedbackOutcome};
