//! DeploymentManager — runs action transitions against the state store.
//!
//! Every public operation runs in a single write transaction: the status
//! log entry, the action change, cancel propagation and the target update
//! of one feedback call commit together or not at all.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_core::{FleetConfig, TenantConfig};
use fleetgrid_state::{
    Action, ActionId, ActionStatus, StateStore, Status, StatusSource, Target,
    TargetUpdateStatus, WriteTxn,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::assign::{self, AssignOutcome, AssignmentRequest, record_status};
use crate::error::{DeployError, DeployResult};
use crate::feedback::Feedback;
use crate::machine::{self, DomainEvent};

/// How submitted config data combines with stored attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigDataMode {
    #[default]
    Merge,
    Replace,
    Remove,
}

/// What a feedback call changed.
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub action: Action,
    pub status: ActionStatus,
    pub events: Vec<DomainEvent>,
}

/// Entry point for assignment, cancellation and device feedback.
#[derive(Clone)]
pub struct DeploymentManager {
    store: StateStore,
    config: Arc<FleetConfig>,
}

impl DeploymentManager {
    pub fn new(store: StateStore, config: Arc<FleetConfig>) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn tenant_config(&self, tenant: &str) -> &TenantConfig {
        self.config.tenant(tenant)
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Register a target administratively. It stays `UNKNOWN` until it polls.
    pub fn create_target(
        &self,
        tenant: &str,
        controller_id: &str,
        attributes: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> DeployResult<Target> {
        self.store.write(|txn| {
            if txn.target(tenant, controller_id)?.is_some() {
                return Err(DeployError::TargetExists(controller_id.to_string()));
            }
            let mut target = Target::new(tenant, controller_id, "system", now);
            target.attributes = attributes;
            txn.put_target(&target)?;
            info!(%tenant, %controller_id, "target created");
            Ok(target)
        })
    }

    pub fn target(&self, tenant: &str, controller_id: &str) -> DeployResult<Target> {
        self.store
            .get_target(tenant, controller_id)?
            .ok_or_else(|| DeployError::TargetNotFound(controller_id.to_string()))
    }

    /// Store attributes pushed by a device and clear its attribute request.
    pub fn update_config_data(
        &self,
        tenant: &str,
        controller_id: &str,
        mode: ConfigDataMode,
        data: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> DeployResult<Target> {
        self.store.write(|txn| {
            let mut target = txn
                .target(tenant, controller_id)?
                .ok_or_else(|| DeployError::TargetNotFound(controller_id.to_string()))?;
            match mode {
                ConfigDataMode::Merge => target.attributes.extend(data),
                ConfigDataMode::Replace => target.attributes = data,
                ConfigDataMode::Remove => {
                    for key in data.keys() {
                        target.attributes.remove(key);
                    }
                }
            }
            target.request_attributes = false;
            target.last_modified_at = now;
            txn.put_target(&target)?;
            debug!(%tenant, %controller_id, ?mode, "target attributes updated");
            Ok(target)
        })
    }

    // ── Assignment and cancellation ───────────────────────────────

    pub fn assign(
        &self,
        tenant: &str,
        controller_id: &str,
        request: &AssignmentRequest,
        now: DateTime<Utc>,
    ) -> DeployResult<AssignOutcome> {
        let config = self.tenant_config(tenant);
        self.store
            .write(|txn| assign::assign_in(txn, config, tenant, controller_id, request, None, now))
    }

    /// Request cancellation of a deployment; returns the cancel-action.
    pub fn cancel(&self, tenant: &str, action_id: ActionId, now: DateTime<Utc>) -> DeployResult<Action> {
        self.store.write(|txn| {
            let original = txn
                .action(tenant, action_id)?
                .ok_or(DeployError::ActionNotFound(action_id))?;
            assign::cancel_in(txn, &original, now)
        })
    }

    /// Administratively refuse a pending cancellation.
    pub fn reject_cancel(
        &self,
        tenant: &str,
        cancel_action_id: ActionId,
        now: DateTime<Utc>,
    ) -> DeployResult<Action> {
        self.store.write(|txn| {
            let cancel = txn
                .action(tenant, cancel_action_id)?
                .filter(Action::is_cancel)
                .ok_or(DeployError::ActionNotFound(cancel_action_id))?;
            let original_id = cancel
                .cancels()
                .ok_or(DeployError::ActionNotFound(cancel_action_id))?;
            let original = txn
                .action(tenant, original_id)?
                .ok_or(DeployError::ActionNotFound(original_id))?;

            let (cancel_t, original_t) = machine::reject_cancel(&cancel, &original, now)?;
            txn.put_action(&cancel_t.action)?;
            record_status(txn, cancel.id, Status::CancelRejected, StatusSource::System, now, vec![
                "cancellation rejected by administrator".to_string(),
            ])?;
            if original_t.action != original {
                txn.put_action(&original_t.action)?;
                record_status(txn, original.id, Status::Running, StatusSource::System, now, vec![
                    format!("cancel action {} rejected", cancel.id),
                ])?;
            }
            info!(%tenant, action_id = original.id, cancel_action_id, "cancellation rejected");
            Ok(cancel_t.action)
        })
    }

    // ── Device feedback ────────────────────────────────────────────

    /// Apply feedback a device posted for one of its deployment actions.
    pub fn deployment_feedback(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        feedback: &Feedback,
        now: DateTime<Utc>,
    ) -> DeployResult<FeedbackOutcome> {
        self.feedback(tenant, controller_id, action_id, feedback, false, now)
    }

    /// Apply feedback a device posted for one of its cancel-actions.
    pub fn cancel_feedback(
        &self,
        tenant: &str,
        controller_id: &str,
        cancel_action_id: ActionId,
        feedback: &Feedback,
        now: DateTime<Utc>,
    ) -> DeployResult<FeedbackOutcome> {
        self.feedback(tenant, controller_id, cancel_action_id, feedback, true, now)
    }

    fn feedback(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        feedback: &Feedback,
        cancel: bool,
        now: DateTime<Utc>,
    ) -> DeployResult<FeedbackOutcome> {
        let config = self.tenant_config(tenant);
        if feedback.messages.len() > config.max_messages_per_status as usize {
            return Err(DeployError::TooManyMessages {
                count: feedback.messages.len(),
                limit: config.max_messages_per_status,
            });
        }

        self.store.write(|txn| {
            // Actions of other targets are indistinguishable from unknown ones.
            let action = txn
                .action(tenant, action_id)?
                .filter(|a| a.controller_id == controller_id && a.is_cancel() == cancel)
                .ok_or(DeployError::ActionNotFound(action_id))?;
            machine::ensure_open(&action)?;

            let limit = config.max_status_entries_per_action;
            if txn.count_action_status(action_id, Some(StatusSource::Device))? >= u64::from(limit) {
                warn!(%tenant, %controller_id, action_id, limit, "status entry limit reached");
                return Err(DeployError::TooManyStatusEntries { action_id, limit });
            }

            let transition = machine::apply(&action, feedback, now)?;
            txn.put_action(&transition.action)?;
            let status = txn.append_action_status(ActionStatus {
                action_id,
                seq: 0,
                status: transition.logged,
                source: StatusSource::Device,
                occurred_at: now,
                code: feedback.code,
                messages: feedback.log_messages(),
            })?;

            let mut events = transition.events.clone();
            for event in &transition.events {
                events.extend(self.handle_event(txn, &transition.action, event, now)?);
            }

            Ok(FeedbackOutcome {
                action: transition.action,
                status,
                events,
            })
        })
    }

    /// React to an event inside the feedback transaction.
    fn handle_event(
        &self,
        txn: &WriteTxn,
        action: &Action,
        event: &DomainEvent,
        now: DateTime<Utc>,
    ) -> DeployResult<Vec<DomainEvent>> {
        let (tenant, controller_id) = (action.tenant.as_str(), action.controller_id.as_str());
        match *event {
            DomainEvent::DeploymentFinished {
                action_id,
                distribution_set,
            } => {
                let mut target = load_target(txn, tenant, controller_id)?;
                target.installed_ds = Some(distribution_set);
                target.installed_at = Some(now);
                target.assigned_ds.get_or_insert(distribution_set);
                target.request_attributes = true;
                target.update_status = if has_other_active_deployments(txn, action, action_id)? {
                    TargetUpdateStatus::Pending
                } else {
                    TargetUpdateStatus::InSync
                };
                target.last_modified_at = now;
                txn.put_target(&target)?;
                info!(%tenant, %controller_id, action_id, distribution_set, "deployment finished");
                Ok(Vec::new())
            }
            DomainEvent::DeploymentFailed { action_id, .. } => {
                let mut target = load_target(txn, tenant, controller_id)?;
                target.update_status = TargetUpdateStatus::Error;
                target.last_modified_at = now;
                txn.put_target(&target)?;
                warn!(%tenant, %controller_id, action_id, "deployment failed");
                Ok(Vec::new())
            }
            DomainEvent::CancelSuperseded { action_id } => {
                let mut events = Vec::new();
                for pending in txn
                    .actions_for_target(tenant, controller_id)?
                    .into_iter()
                    .filter(|a| a.active && a.cancels() == Some(action_id))
                {
                    let t = machine::supersede_cancel(&pending, now);
                    txn.put_action(&t.action)?;
                    record_status(txn, pending.id, Status::Finished, StatusSource::System, now, vec![
                        format!("action {action_id} closed before cancellation"),
                    ])?;
                    events.extend(t.events);
                }
                Ok(events)
            }
            DomainEvent::CancelConfirmed {
                action_id,
                cancel_action_id,
            } => {
                let Some(original) = txn.action(tenant, action_id)? else {
                    warn!(%tenant, action_id, cancel_action_id, "canceled action vanished");
                    return Ok(Vec::new());
                };
                if machine::ensure_open(&original).is_err() {
                    return Ok(Vec::new());
                }
                let t = machine::confirm_cancel(&original, now);
                txn.put_action(&t.action)?;
                record_status(txn, action_id, Status::Canceled, StatusSource::System, now, vec![
                    format!("canceled by action {cancel_action_id}"),
                ])?;

                let mut target = load_target(txn, tenant, controller_id)?;
                let canceled_ds = original.deployment().map(|d| d.distribution_set);
                if target.assigned_ds.is_some() && target.assigned_ds == canceled_ds {
                    target.assigned_ds = target.installed_ds;
                }
                if !has_other_active_deployments(txn, &original, action_id)? {
                    target.update_status = if target.installed_ds.is_some() {
                        TargetUpdateStatus::InSync
                    } else {
                        TargetUpdateStatus::Registered
                    };
                }
                target.last_modified_at = now;
                txn.put_target(&target)?;
                info!(%tenant, %controller_id, action_id, cancel_action_id, "cancellation confirmed");
                Ok(t.events)
            }
            DomainEvent::StatusChanged { .. }
            | DomainEvent::CancelRequested { .. }
            | DomainEvent::CancelRejected { .. } => Ok(Vec::new()),
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// All actions of a target in creation order.
    pub fn actions(&self, tenant: &str, controller_id: &str) -> DeployResult<Vec<Action>> {
        self.store.read(|txn| {
            if txn.target(tenant, controller_id)?.is_none() {
                return Err(DeployError::TargetNotFound(controller_id.to_string()));
            }
            Ok(txn.actions_for_target(tenant, controller_id)?)
        })
    }

    pub fn action(&self, tenant: &str, action_id: ActionId) -> DeployResult<Action> {
        self.store
            .get_action(tenant, action_id)?
            .ok_or(DeployError::ActionNotFound(action_id))
    }

    /// Status log of an action, oldest first.
    pub fn history(&self, action_id: ActionId) -> DeployResult<Vec<ActionStatus>> {
        Ok(self.store.list_action_status(action_id)?)
    }
}

fn load_target(txn: &WriteTxn, tenant: &str, controller_id: &str) -> DeployResult<Target> {
    txn.target(tenant, controller_id)?
        .ok_or_else(|| DeployError::TargetNotFound(controller_id.to_string()))
}

fn has_other_active_deployments(
    txn: &WriteTxn,
    action: &Action,
    except: ActionId,
) -> DeployResult<bool> {
    Ok(txn
        .actions_for_target(&action.tenant, &action.controller_id)?
        .iter()
        .any(|a| a.id != except && a.active && !a.is_cancel() && a.status != Status::Canceling))
}
