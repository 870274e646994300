//! Assignment and cancellation inside an open write transaction.
//!
//! These functions are shared by the [`DeploymentManager`](crate::DeploymentManager)
//! and the rollout engine, which needs to create actions for a whole group
//! atomically with the group's own status change.

use chrono::{DateTime, Utc};
use fleet_core::TenantConfig;
use fleetgrid_maintenance::WindowEvaluator;
use fleetgrid_state::{
    Action, ActionId, ActionKind, ActionStatus, ActionType, Deployment, DistributionSetId,
    MaintenanceSchedule, RolloutRef, Status, StatusSource, TargetUpdateStatus, WriteTxn,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DeployError, DeployResult};
use crate::machine;

/// Highest accepted assignment weight.
pub const MAX_WEIGHT: u16 = 1000;

pub(crate) const ACTION_SEQUENCE: &str = "action";

/// What to deploy and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRequest {
    pub distribution_set: DistributionSetId,
    #[serde(default = "default_action_type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub maintenance: Option<MaintenanceSchedule>,
}

fn default_action_type() -> ActionType {
    ActionType::Forced
}

impl AssignmentRequest {
    pub fn forced(distribution_set: DistributionSetId) -> Self {
        Self {
            distribution_set,
            action_type: ActionType::Forced,
            forced_time: None,
            weight: None,
            maintenance: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_maintenance(mut self, schedule: &str, duration: &str, timezone: &str) -> Self {
        self.maintenance = Some(MaintenanceSchedule {
            schedule: schedule.to_string(),
            duration: duration.to_string(),
            timezone: timezone.to_string(),
        });
        self
    }

    /// Check the request and return the weight to store.
    fn validate(&self, config: &TenantConfig, now: DateTime<Utc>) -> DeployResult<Option<u16>> {
        if self.action_type == ActionType::TimeForced && self.forced_time.is_none() {
            return Err(DeployError::InvalidAssignment(
                "time_forced requires forced_time".to_string(),
            ));
        }
        if let Some(m) = &self.maintenance {
            WindowEvaluator::validate_new(&m.schedule, &m.duration, &m.timezone, now)?;
        }
        let weight = match self.weight {
            Some(w) if w > u32::from(MAX_WEIGHT) => {
                return Err(DeployError::InvalidAssignment(format!(
                    "weight {w} outside 0..={MAX_WEIGHT}"
                )));
            }
            Some(w) => u16::try_from(w).ok(),
            None if config.multi_assignments => Some(MAX_WEIGHT),
            None => None,
        };
        Ok(weight)
    }
}

/// Result of an assignment.
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    /// A new deployment action was created; `canceled` lists the
    /// cancel-actions issued for deployments it replaces.
    Assigned {
        action: Action,
        canceled: Vec<ActionId>,
    },
    /// An active deployment of the same distribution set already exists.
    AlreadyAssigned { action_id: ActionId },
}

/// Assign a distribution set to an existing target.
pub fn assign_in(
    txn: &WriteTxn,
    config: &TenantConfig,
    tenant: &str,
    controller_id: &str,
    request: &AssignmentRequest,
    rollout: Option<RolloutRef>,
    now: DateTime<Utc>,
) -> DeployResult<AssignOutcome> {
    let weight = request.validate(config, now)?;
    let mut target = txn
        .target(tenant, controller_id)?
        .ok_or_else(|| DeployError::TargetNotFound(controller_id.to_string()))?;
    let ds = request.distribution_set;
    if txn.distribution_set(tenant, ds)?.is_none() {
        return Err(DeployError::DistributionSetNotFound(ds));
    }

    let existing = txn.actions_for_target(tenant, controller_id)?;
    if let Some(current) = existing.iter().find(|a| {
        a.active
            && a.status != Status::Canceling
            && a.deployment().is_some_and(|d| d.distribution_set == ds)
    }) {
        return Ok(AssignOutcome::AlreadyAssigned {
            action_id: current.id,
        });
    }

    let mut canceled = Vec::new();
    if !config.multi_assignments {
        for running in existing
            .iter()
            .filter(|a| a.active && !a.is_cancel() && a.status != Status::Canceling)
        {
            canceled.push(cancel_in(txn, running, now)?.id);
        }
    }

    let action = Action {
        id: txn.next_id(ACTION_SEQUENCE)?,
        tenant: tenant.to_string(),
        controller_id: controller_id.to_string(),
        kind: ActionKind::Deployment(Deployment {
            distribution_set: ds,
            action_type: request.action_type,
            forced_time: request.forced_time,
            weight,
            maintenance: request.maintenance.clone(),
        }),
        status: Status::Running,
        active: true,
        rollout,
        created_at: now,
        last_modified_at: now,
    };
    txn.put_action(&action)?;
    record_status(txn, action.id, Status::Running, StatusSource::System, now, vec![
        "assignment initiated".to_string(),
    ])?;

    target.assigned_ds = Some(ds);
    target.update_status = TargetUpdateStatus::Pending;
    target.last_modified_at = now;
    txn.put_target(&target)?;

    info!(
        %tenant,
        %controller_id,
        action_id = action.id,
        distribution_set = ds,
        replaced = canceled.len(),
        "distribution set assigned"
    );
    Ok(AssignOutcome::Assigned { action, canceled })
}

/// Request cancellation of `original`, returning the new cancel-action.
pub fn cancel_in(txn: &WriteTxn, original: &Action, now: DateTime<Utc>) -> DeployResult<Action> {
    let cancel_id = txn.next_id(ACTION_SEQUENCE)?;
    let (transition, cancel) = machine::request_cancel(original, cancel_id, now)?;

    txn.put_action(&transition.action)?;
    record_status(txn, original.id, Status::Canceling, StatusSource::System, now, vec![
        format!("cancellation requested by action {cancel_id}"),
    ])?;
    txn.put_action(&cancel)?;
    record_status(txn, cancel.id, Status::Running, StatusSource::System, now, vec![
        format!("cancel action {}", original.id),
    ])?;

    info!(
        tenant = %original.tenant,
        controller_id = %original.controller_id,
        action_id = original.id,
        cancel_action_id = cancel.id,
        "cancellation requested"
    );
    Ok(cancel)
}

pub(crate) fn record_status(
    txn: &WriteTxn,
    action_id: ActionId,
    status: Status,
    source: StatusSource,
    now: DateTime<Utc>,
    messages: Vec<String>,
) -> DeployResult<ActionStatus> {
    Ok(txn.append_action_status(ActionStatus {
        action_id,
        seq: 0,
        status,
        source,
        occurred_at: now,
        code: None,
        messages,
    })?)
}
