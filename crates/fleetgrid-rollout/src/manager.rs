//! Rollout lifecycle operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_core::{FleetConfig, TenantConfig};
use fleetgrid_deploy::MAX_WEIGHT;
use fleetgrid_deploy::assign::cancel_in;
use fleetgrid_state::{
    ActionType, DistributionSetId, ErrorAction, GroupCondition, Rollout, RolloutGroup,
    RolloutGroupStatus, RolloutId, RolloutStatus, StateStore, Status, SuccessAction, WriteTxn,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::condition::{TotalTargetCountStatus, parse_threshold};
use crate::error::{RolloutError, RolloutResult};
use crate::partition::{GroupDefinition, GroupPlan, PartitionLimits, partition};
use crate::selector::TargetSelector;

const ROLLOUT_SEQUENCE: &str = "rollout";
const GROUP_SEQUENCE: &str = "rollout_group";

/// Parameters of a new rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutCreate {
    pub name: String,
    pub target_filter: String,
    pub distribution_set: DistributionSetId,
    #[serde(default = "default_action_type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub forced_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub weight: Option<u32>,
    /// Start automatically once this instant has passed.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub amount_groups: Option<u32>,
    #[serde(default)]
    pub groups: Vec<GroupDefinition>,
    #[serde(default = "default_success_condition")]
    pub success_condition: GroupCondition,
    #[serde(default = "default_success_action")]
    pub success_action: SuccessAction,
    #[serde(default)]
    pub error_condition: Option<GroupCondition>,
    #[serde(default)]
    pub error_action: Option<ErrorAction>,
}

fn default_action_type() -> ActionType {
    ActionType::Forced
}

fn default_success_condition() -> GroupCondition {
    GroupCondition::threshold("100")
}

fn default_success_action() -> SuccessAction {
    SuccessAction::Nextgroup
}

impl RolloutCreate {
    /// A forced rollout over `amount_groups` evenly sized groups.
    pub fn new(
        name: &str,
        target_filter: &str,
        distribution_set: DistributionSetId,
        amount_groups: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            target_filter: target_filter.to_string(),
            distribution_set,
            action_type: ActionType::Forced,
            forced_time: None,
            weight: None,
            start_at: None,
            amount_groups: Some(amount_groups),
            groups: Vec::new(),
            success_condition: default_success_condition(),
            success_action: default_success_action(),
            error_condition: None,
            error_action: None,
        }
    }

    fn plan(&self) -> RolloutResult<GroupPlan> {
        match (self.amount_groups, self.groups.is_empty()) {
            (Some(_), false) => Err(RolloutError::InvalidDefinition(
                "amount_groups and groups are mutually exclusive".to_string(),
            )),
            (Some(n), true) => Ok(GroupPlan::Amount(n)),
            (None, false) => Ok(GroupPlan::Explicit(self.groups.clone())),
            (None, true) => Err(RolloutError::InvalidDefinition(
                "either amount_groups or groups is required".to_string(),
            )),
        }
    }

    fn validate(&self) -> RolloutResult<Option<u16>> {
        if self.name.trim().is_empty() {
            return Err(RolloutError::InvalidDefinition("name must not be empty".to_string()));
        }
        if self.action_type == ActionType::TimeForced && self.forced_time.is_none() {
            return Err(RolloutError::InvalidDefinition(
                "time_forced requires forced_time".to_string(),
            ));
        }
        parse_threshold(&self.success_condition)?;
        if let Some(cond) = &self.error_condition {
            parse_threshold(cond)?;
        }
        for group in &self.groups {
            for cond in [&group.success_condition, &group.error_condition]
                .into_iter()
                .flatten()
            {
                parse_threshold(cond)?;
            }
        }
        match self.weight {
            Some(w) if w > u32::from(MAX_WEIGHT) => Err(RolloutError::InvalidDefinition(format!(
                "weight {w} outside 0..={MAX_WEIGHT}"
            ))),
            Some(w) => Ok(u16::try_from(w).ok()),
            None => Ok(None),
        }
    }
}

/// A rollout together with its groups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutDetail {
    #[serde(flatten)]
    pub rollout: Rollout,
    pub groups: Vec<RolloutGroup>,
}

/// Current action counts of one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupCounts {
    pub group: RolloutGroup,
    pub counts: TotalTargetCountStatus,
}

/// Creates rollouts and drives their administrative state changes.
#[derive(Clone)]
pub struct RolloutManager {
    store: StateStore,
    config: Arc<FleetConfig>,
    selector: Arc<dyn TargetSelector>,
}

impl RolloutManager {
    pub fn new(store: StateStore, config: Arc<FleetConfig>, selector: Arc<dyn TargetSelector>) -> Self {
        Self {
            store,
            config,
            selector,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn tenant_config(&self, tenant: &str) -> &TenantConfig {
        self.config.tenant(tenant)
    }

    /// Select and partition the targets, then store the rollout as `READY`.
    ///
    /// Group membership is fixed here and never recomputed.
    pub fn create(&self, tenant: &str, request: &RolloutCreate, now: DateTime<Utc>) -> RolloutResult<RolloutDetail> {
        let weight = request.validate()?;
        let plan = request.plan()?;
        let ds = request.distribution_set;
        if self.store.get_distribution_set(tenant, ds)?.is_none() {
            return Err(RolloutError::DistributionSetNotFound(ds));
        }

        let tenant_config = self.tenant_config(tenant);
        let limits = PartitionLimits {
            max_groups: tenant_config.max_groups_per_rollout,
            max_per_group: tenant_config.max_targets_per_rollout_group,
        };
        let targets = self.selector.select(tenant, &request.target_filter)?;
        let total = targets.len() as u64;
        let members = partition(targets, &plan, limits)?;

        let detail = self.store.write(|txn| {
            let mut rollout = Rollout {
                id: txn.next_id(ROLLOUT_SEQUENCE)?,
                tenant: tenant.to_string(),
                name: request.name.clone(),
                target_filter: request.target_filter.clone(),
                distribution_set: ds,
                action_type: request.action_type,
                forced_time: request.forced_time,
                weight,
                status: RolloutStatus::Creating,
                total_targets: total,
                groups_created: members.len() as u32,
                start_at: request.start_at,
                last_check: None,
                created_at: now,
            };
            txn.put_rollout(&rollout)?;

            let mut groups = Vec::with_capacity(members.len());
            let mut parent = None;
            for (position, targets) in members.iter().enumerate() {
                let definition = request.groups.get(position);
                let error_condition = definition
                    .and_then(|d| d.error_condition.clone())
                    .or_else(|| request.error_condition.clone());
                let error_action = error_condition
                    .as_ref()
                    .map(|_| request.error_action.unwrap_or(ErrorAction::Pause));
                let group = RolloutGroup {
                    id: txn.next_id(GROUP_SEQUENCE)?,
                    rollout_id: rollout.id,
                    position: position as u32,
                    name: definition
                        .and_then(|d| d.name.clone())
                        .unwrap_or_else(|| format!("group-{}", position + 1)),
                    status: RolloutGroupStatus::Ready,
                    success_condition: definition
                        .and_then(|d| d.success_condition.clone())
                        .unwrap_or_else(|| request.success_condition.clone()),
                    success_action: request.success_action,
                    error_condition,
                    error_action,
                    total_targets: targets.len() as u64,
                    parent,
                };
                txn.put_group(&group)?;
                for (index, controller_id) in targets.iter().enumerate() {
                    txn.add_group_target(group.id, index as u64, controller_id)?;
                }
                parent = Some(group.id);
                groups.push(group);
            }

            txn.transition_rollout(rollout.id, &[RolloutStatus::Creating], RolloutStatus::Ready)?;
            rollout.status = RolloutStatus::Ready;
            Ok::<_, RolloutError>(RolloutDetail { rollout, groups })
        })?;

        info!(
            %tenant,
            rollout_id = detail.rollout.id,
            name = %detail.rollout.name,
            targets = total,
            groups = detail.groups.len(),
            "rollout created"
        );
        Ok(detail)
    }

    /// READY → RUNNING; all READY groups become SCHEDULED.
    pub fn start(&self, tenant: &str, id: RolloutId) -> RolloutResult<Rollout> {
        let rollout = self.store.write(|txn| {
            let rollout = txn.rollout(tenant, id)?.ok_or(RolloutError::NotFound(id))?;
            if !start_in(txn, id)? {
                return Err(RolloutError::InvalidTransition {
                    id,
                    status: rollout.status,
                    operation: "start",
                });
            }
            Ok(Rollout {
                status: RolloutStatus::Running,
                ..rollout
            })
        })?;
        info!(%tenant, rollout_id = id, "rollout started");
        Ok(rollout)
    }

    pub fn pause(&self, tenant: &str, id: RolloutId) -> RolloutResult<Rollout> {
        let rollout = self.transition(tenant, id, &[RolloutStatus::Running], RolloutStatus::Paused, "pause")?;
        info!(%tenant, rollout_id = id, "rollout paused");
        Ok(rollout)
    }

    pub fn resume(&self, tenant: &str, id: RolloutId) -> RolloutResult<Rollout> {
        let rollout = self.transition(tenant, id, &[RolloutStatus::Paused], RolloutStatus::Running, "resume")?;
        info!(%tenant, rollout_id = id, "rollout resumed");
        Ok(rollout)
    }

    /// Stop the rollout and cancel every deployment it still has running.
    pub fn stop(&self, tenant: &str, id: RolloutId, now: DateTime<Utc>) -> RolloutResult<Rollout> {
        let (rollout, canceled) = self.store.write(|txn| {
            let rollout = txn.rollout(tenant, id)?.ok_or(RolloutError::NotFound(id))?;
            let stoppable = [RolloutStatus::Ready, RolloutStatus::Running, RolloutStatus::Paused];
            if !txn.transition_rollout(id, &stoppable, RolloutStatus::Stopped)? {
                return Err(RolloutError::InvalidTransition {
                    id,
                    status: rollout.status,
                    operation: "stop",
                });
            }

            let mut canceled = 0usize;
            for group in txn.groups_of(id)? {
                for action in txn.actions_of(group.id)? {
                    if action.active && !action.is_cancel() && action.status != Status::Canceling {
                        cancel_in(txn, &action, now)?;
                        canceled += 1;
                    }
                }
            }
            Ok((
                Rollout {
                    status: RolloutStatus::Stopped,
                    ..rollout
                },
                canceled,
            ))
        })?;
        info!(%tenant, rollout_id = id, canceled, "rollout stopped");
        Ok(rollout)
    }

    /// Remove a rollout that is not in progress. Its actions are kept.
    pub fn delete(&self, tenant: &str, id: RolloutId) -> RolloutResult<()> {
        let deletable = [
            RolloutStatus::Creating,
            RolloutStatus::Ready,
            RolloutStatus::Stopped,
            RolloutStatus::Finished,
            RolloutStatus::Error,
        ];
        self.transition(tenant, id, &deletable, RolloutStatus::Deleting, "delete")?;
        self.purge(id)?;
        info!(%tenant, rollout_id = id, "rollout deleted");
        Ok(())
    }

    /// Drop a rollout already marked `DELETING`.
    pub(crate) fn purge(&self, id: RolloutId) -> RolloutResult<bool> {
        self.store.write(|txn| {
            match txn.rollout_by_id(id)? {
                Some(r) if r.status == RolloutStatus::Deleting => Ok(txn.delete_rollout(id)?),
                _ => Ok(false),
            }
        })
    }

    pub fn get(&self, tenant: &str, id: RolloutId) -> RolloutResult<RolloutDetail> {
        self.store.read(|txn| {
            let rollout = txn.rollout(tenant, id)?.ok_or(RolloutError::NotFound(id))?;
            let groups = txn.groups_of(id)?;
            Ok(RolloutDetail { rollout, groups })
        })
    }

    pub fn list(&self, tenant: &str) -> RolloutResult<Vec<Rollout>> {
        Ok(self.store.list_rollouts(Some(tenant))?)
    }

    /// Per-group action counts, read from one snapshot.
    pub fn group_counts(&self, tenant: &str, id: RolloutId) -> RolloutResult<Vec<GroupCounts>> {
        self.store.read(|txn| {
            let rollout = txn.rollout(tenant, id)?.ok_or(RolloutError::NotFound(id))?;
            let mut result = Vec::new();
            for group in txn.groups_of(id)? {
                let members = match group.status {
                    RolloutGroupStatus::Creating
                    | RolloutGroupStatus::Ready
                    | RolloutGroupStatus::Scheduled => Vec::new(),
                    _ => txn.group_member_actions(tenant, group.id, rollout.distribution_set)?,
                };
                let counts = TotalTargetCountStatus::from_members(group.total_targets, &members);
                result.push(GroupCounts { group, counts });
            }
            Ok(result)
        })
    }

    fn transition(
        &self,
        tenant: &str,
        id: RolloutId,
        expected: &[RolloutStatus],
        new: RolloutStatus,
        operation: &'static str,
    ) -> RolloutResult<Rollout> {
        self.store.write(|txn| {
            let rollout = txn.rollout(tenant, id)?.ok_or(RolloutError::NotFound(id))?;
            if !txn.transition_rollout(id, expected, new)? {
                return Err(RolloutError::InvalidTransition {
                    id,
                    status: rollout.status,
                    operation,
                });
            }
            Ok(Rollout {
                status: new,
                ..rollout
            })
        })
    }
}

/// READY → RUNNING with its groups scheduled. `false` if the rollout was
/// not READY.
pub(crate) fn start_in(txn: &WriteTxn, id: RolloutId) -> RolloutResult<bool> {
    if !txn.transition_rollout(id, &[RolloutStatus::Ready], RolloutStatus::Running)? {
        return Ok(false);
    }
    for group in txn.groups_of(id)? {
        txn.transition_group(group.id, &[RolloutGroupStatus::Ready], RolloutGroupStatus::Scheduled)?;
    }
    Ok(true)
}
