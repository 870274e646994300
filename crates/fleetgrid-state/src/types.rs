//! Domain types for the FleetGrid state store.
//!
//! These types represent the persisted state of targets, distribution sets,
//! actions, rollouts and rollout groups. Records refer to each other by id
//! only; reverse navigation goes through the store's index tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ActionId = u64;
pub type DistributionSetId = u64;
pub type RolloutId = u64;
pub type GroupId = u64;

/// Build the composite key for a target.
pub fn target_key(tenant: &str, controller_id: &str) -> String {
    format!("{tenant}/{controller_id}")
}

// ── Target ────────────────────────────────────────────────────────

/// Synchronisation state of a target as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetUpdateStatus {
    /// Known to the server but never polled.
    Unknown,
    /// Has polled at least once, nothing pending.
    Registered,
    /// An assignment is in flight.
    Pending,
    /// The last deployment failed.
    Error,
    /// The installed set matches the assigned set.
    InSync,
}

/// A managed device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub tenant: String,
    pub controller_id: String,
    pub update_status: TargetUpdateStatus,
    /// Last known source address of a poll.
    pub address: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub assigned_ds: Option<DistributionSetId>,
    pub installed_ds: Option<DistributionSetId>,
    pub installed_at: Option<DateTime<Utc>>,
    /// Device should push its attributes on the next poll.
    pub request_attributes: bool,
    pub attributes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_modified_at: DateTime<Utc>,
}

impl Target {
    /// A target record as created by an administrator (never polled).
    pub fn new(tenant: &str, controller_id: &str, created_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            tenant: tenant.to_string(),
            controller_id: controller_id.to_string(),
            update_status: TargetUpdateStatus::Unknown,
            address: None,
            last_poll_at: None,
            assigned_ds: None,
            installed_ds: None,
            installed_at: None,
            request_attributes: true,
            attributes: BTreeMap::new(),
            created_at: now,
            created_by: created_by.to_string(),
            last_modified_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        target_key(&self.tenant, &self.controller_id)
    }
}

// ── Distribution set ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub filename: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the artifact.
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoftwareModule {
    /// Module type, e.g. `os`, `bApp`.
    pub part: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// The software bundle to install.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSet {
    pub id: DistributionSetId,
    pub tenant: String,
    pub name: String,
    pub version: String,
    pub modules: Vec<SoftwareModule>,
    pub created_at: DateTime<Utc>,
}

// ── Action ────────────────────────────────────────────────────────

/// How insistently a deployment should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Forced,
    Soft,
    /// Soft until `forced_time`, forced afterwards.
    TimeForced,
    /// Download but never install.
    DownloadOnly,
}

/// Lifecycle state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Scheduled,
    Running,
    Download,
    Downloaded,
    Canceling,
    Canceled,
    CancelRejected,
    Finished,
    Error,
    Warning,
    Retrieved,
}

impl Status {
    /// `FINISHED`, `ERROR` and `CANCELED` end an action for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Error | Status::Canceled)
    }
}

/// Recurring window during which installation is allowed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    /// Cron expression: second minute hour day-of-month month weekday [year].
    pub schedule: String,
    /// Window length, `HH:mm:ss` or ISO-8601 (`PT1H`).
    pub duration: String,
    /// Fixed UTC offset such as `+02:00`.
    pub timezone: String,
}

/// Parameters of a deployment action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub distribution_set: DistributionSetId,
    pub action_type: ActionType,
    pub forced_time: Option<DateTime<Utc>>,
    /// Priority in multi-assignment mode, higher first.
    pub weight: Option<u16>,
    pub maintenance: Option<MaintenanceSchedule>,
}

/// What an action instructs the target to do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionKind {
    Deployment(Deployment),
    Cancel { cancels: ActionId },
}

/// Rollout membership of an action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutRef {
    pub rollout_id: RolloutId,
    pub group_id: GroupId,
}

/// One instruction directed at a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub tenant: String,
    pub controller_id: String,
    pub kind: ActionKind,
    pub status: Status,
    pub active: bool,
    pub rollout: Option<RolloutRef>,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

impl Action {
    pub fn target_key(&self) -> String {
        target_key(&self.tenant, &self.controller_id)
    }

    pub fn deployment(&self) -> Option<&Deployment> {
        match &self.kind {
            ActionKind::Deployment(d) => Some(d),
            ActionKind::Cancel { .. } => None,
        }
    }

    /// The action a cancel-action refers to.
    pub fn cancels(&self) -> Option<ActionId> {
        match self.kind {
            ActionKind::Cancel { cancels } => Some(cancels),
            ActionKind::Deployment(_) => None,
        }
    }

    pub fn is_cancel(&self) -> bool {
        self.cancels().is_some()
    }

    pub fn weight(&self) -> Option<u16> {
        self.deployment().and_then(|d| d.weight)
    }
}

/// Who produced a status log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// Written by the server (creation, cancellation request, ...).
    System,
    /// Reported by the device through feedback.
    Device,
}

/// One immutable entry in an action's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatus {
    pub action_id: ActionId,
    /// Position in the action's log, assigned on append.
    pub seq: u64,
    pub status: Status,
    pub source: StatusSource,
    pub occurred_at: DateTime<Utc>,
    pub code: Option<i32>,
    pub messages: Vec<String>,
}

// ── Rollout ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Running,
    Paused,
    Stopped,
    Finished,
    Error,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutGroupStatus {
    Creating,
    Ready,
    Scheduled,
    Running,
    Finished,
    Error,
}

impl RolloutGroupStatus {
    /// Groups in these states no longer take part in progression.
    pub fn is_settled(self) -> bool {
        matches!(self, RolloutGroupStatus::Finished | RolloutGroupStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionKind {
    /// Percentage of the group's targets, given by the expression.
    Threshold,
}

/// A condition evaluated against a group's action counts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupCondition {
    pub kind: ConditionKind,
    pub expression: String,
}

impl GroupCondition {
    pub fn threshold(percent: &str) -> Self {
        Self {
            kind: ConditionKind::Threshold,
            expression: percent.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SuccessAction {
    /// Finish the group and move on to the next one.
    #[serde(alias = "NEXT_GROUP")]
    Nextgroup,
    /// Finish the group and pause the rollout.
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorAction {
    /// Mark the group failed and pause the rollout.
    Pause,
}

/// A multi-stage campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub tenant: String,
    pub name: String,
    pub target_filter: String,
    pub distribution_set: DistributionSetId,
    pub action_type: ActionType,
    pub forced_time: Option<DateTime<Utc>>,
    pub weight: Option<u16>,
    pub status: RolloutStatus,
    pub total_targets: u64,
    /// Number of groups materialized at creation.
    pub groups_created: u32,
    /// Start automatically once this instant has passed.
    pub start_at: Option<DateTime<Utc>>,
    /// Last time the scheduler examined this rollout.
    pub last_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// An ordered batch within a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: GroupId,
    pub rollout_id: RolloutId,
    /// Zero-based position in the rollout.
    pub position: u32,
    pub name: String,
    pub status: RolloutGroupStatus,
    pub success_condition: GroupCondition,
    pub success_action: SuccessAction,
    pub error_condition: Option<GroupCondition>,
    pub error_action: Option<ErrorAction>,
    pub total_targets: u64,
    /// The preceding group, if any.
    pub parent: Option<GroupId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        let terminal: Vec<Status> = [
            Status::Scheduled,
            Status::Running,
            Status::Download,
            Status::Downloaded,
            Status::Canceling,
            Status::Canceled,
            Status::CancelRejected,
            Status::Finished,
            Status::Error,
            Status::Warning,
            Status::Retrieved,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(terminal, vec![Status::Canceled, Status::Finished, Status::Error]);
    }

    #[test]
    fn action_kind_is_tagged() {
        let kind = ActionKind::Cancel { cancels: 7 };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "cancel");
        assert_eq!(json["cancels"], 7);
    }

    #[test]
    fn success_action_accepts_both_spellings() {
        let a: SuccessAction = serde_json::from_str("\"NEXTGROUP\"").unwrap();
        let b: SuccessAction = serde_json::from_str("\"NEXT_GROUP\"").unwrap();
        assert_eq!(a, b);
    }
}
