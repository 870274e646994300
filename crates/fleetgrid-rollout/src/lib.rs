//! FleetGrid staged rollouts — group partitioning, thresholds, scheduler.
//!
//! A rollout assigns one distribution set to a filtered population of
//! targets in ordered groups. Each group is started, watched and closed
//! according to its success and error conditions before the next one
//! begins.
//!
//! # Components
//!
//! - **`selector`** — Target filter evaluation (`TargetSelector` trait)
//! - **`partition`** — Splitting the selected targets into groups
//! - **`condition`** — Action counts and threshold evaluation
//! - **`manager`** — Rollout lifecycle operations (create, start, pause, ...)
//! - **`scheduler`** — Periodic progression of running rollouts

pub mod condition;
pub mod error;
pub mod manager;
pub mod partition;
pub mod scheduler;
pub mod selector;

pub use condition::{CountState, TotalTargetCountStatus};
pub use error::{RolloutError, RolloutResult};
pub use manager::{GroupCounts, RolloutCreate, RolloutDetail, RolloutManager};
pub use partition::{GroupDefinition, GroupPlan, PartitionLimits};
pub use scheduler::{RolloutScheduler, TickReport};
pub use selector::{StoreTargetSelector, TargetSelector};
