//! DdiGateway — request handlers of the device polling protocol.
//!
//! Each method serves one device request, scoped to a tenant and a
//! controller id. Lookups of actions that belong to another target fail
//! exactly like lookups of unknown actions.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use fleet_core::format_hms;
use fleetgrid_deploy::{DeploymentManager, FeedbackOutcome, MAX_WEIGHT};
use fleetgrid_state::{Action, ActionId, ActionStatus, Status, Target};
use tracing::{debug, info, warn};

use crate::error::{DdiError, DdiResult};
use crate::etag::ETagBuilder;
use crate::handling;
use crate::wire::*;

/// A response document with its validator.
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    pub body: T,
    pub etag: String,
}

#[derive(Clone)]
pub struct DdiGateway {
    deployments: DeploymentManager,
}

impl DdiGateway {
    pub fn new(deployments: DeploymentManager) -> Self {
        Self { deployments }
    }

    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// Register or touch the target and tell it what to do next.
    pub fn poll(
        &self,
        tenant: &str,
        controller_id: &str,
        address: Option<&str>,
        now: DateTime<Utc>,
    ) -> DdiResult<Tagged<ControllerBase>> {
        let config = self.deployments.tenant_config(tenant);
        let store = self.deployments.store();

        let (target, created) =
            store.write(|txn| txn.create_or_touch_target(tenant, controller_id, address, now))?;
        if created {
            info!(%tenant, %controller_id, ?address, "target registered on first poll");
        }

        let actions = store.list_actions_for_target(tenant, controller_id)?;
        let current = current_deployment(&actions, config.multi_assignments);
        let cancel = actions.iter().find(|a| a.active && a.is_cancel());
        let installed = actions
            .iter()
            .rev()
            .find(|a| !a.is_cancel() && a.status == Status::Finished);

        let window = current
            .and_then(Action::deployment)
            .map(handling::window_of)
            .unwrap_or_default();
        let sleep = handling::poll_sleep(config, &window, now);

        let base = base_path(tenant, controller_id);
        let links = ControllerLinks {
            deployment_base: current
                .map(|a| Link::new(format!("{base}/deploymentBase/{}", a.id))),
            cancel_action: cancel.map(|a| Link::new(format!("{base}/cancelAction/{}", a.id))),
            config_data: target
                .request_attributes
                .then(|| Link::new(format!("{base}/configData"))),
            installed_base: installed
                .map(|a| Link::new(format!("{base}/installedBase/{}", a.id))),
        };

        let etag = ETagBuilder::new("poll")
            .part("assigned", target.assigned_ds)
            .part("installed", target.installed_ds)
            .part("deployment", current.map(|a| (a.id, a.status)))
            .part("cancel", cancel.map(|a| (a.id, a.status)))
            .part("installed_action", installed.map(|a| a.id))
            .part("config_data", target.request_attributes)
            .part("sleep", sleep.as_secs())
            .finish();

        debug!(
            %tenant,
            %controller_id,
            deployment = ?current.map(|a| a.id),
            cancel = ?cancel.map(|a| a.id),
            sleep_secs = sleep.as_secs(),
            "poll served"
        );

        Ok(Tagged {
            body: ControllerBase {
                config: ControllerConfig {
                    polling: Polling {
                        sleep: format_hms(sleep),
                    },
                },
                links,
            },
            etag,
        })
    }

    /// Deployment instructions for one of the target's actions.
    ///
    /// `history` selects the status log slice: `n > 0` the newest `n`
    /// entries, `-1` all of them, anything else none.
    pub fn deployment_base(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        history: Option<i64>,
        now: DateTime<Utc>,
    ) -> DdiResult<Tagged<DeploymentBase>> {
        let action = self.device_action(tenant, controller_id, action_id, false)?;
        self.deployment_document(&action, history, now)
    }

    /// Deployment document of the action that installed the current set.
    pub fn installed_base(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        history: Option<i64>,
        now: DateTime<Utc>,
    ) -> DdiResult<Tagged<DeploymentBase>> {
        let action = self.device_action(tenant, controller_id, action_id, false)?;
        if action.status != Status::Finished {
            return Err(DdiError::NotInstalled(action_id));
        }
        self.deployment_document(&action, history, now)
    }

    pub fn deployment_feedback(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        body: ActionFeedback,
        now: DateTime<Utc>,
    ) -> DdiResult<FeedbackOutcome> {
        self.ensure_target(tenant, controller_id)?;
        let feedback = body.into_feedback();
        self.deployments
            .deployment_feedback(tenant, controller_id, action_id, &feedback, now)
            .map_err(|e| {
                warn!(%tenant, %controller_id, action_id, kind = ?e.kind(), error = %e, "deployment feedback rejected");
                DdiError::from(e)
            })
    }

    /// The cancel instruction behind a `cancelAction` link.
    pub fn cancel_action(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
    ) -> DdiResult<Tagged<CancelBase>> {
        let action = self.device_action(tenant, controller_id, action_id, true)?;
        let stop_id = action.cancels().ok_or(DdiError::ActionNotFound(action_id))?;
        let etag = ETagBuilder::new("cancel")
            .part("action", (action.id, action.status))
            .part("stop", stop_id)
            .finish();
        Ok(Tagged {
            body: CancelBase {
                id: action.id.to_string(),
                cancel_action: CancelInstruction {
                    stop_id: stop_id.to_string(),
                },
            },
            etag,
        })
    }

    pub fn cancel_feedback(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        body: ActionFeedback,
        now: DateTime<Utc>,
    ) -> DdiResult<FeedbackOutcome> {
        self.ensure_target(tenant, controller_id)?;
        let feedback = body.into_feedback();
        self.deployments
            .cancel_feedback(tenant, controller_id, action_id, &feedback, now)
            .map_err(|e| {
                warn!(%tenant, %controller_id, action_id, kind = ?e.kind(), error = %e, "cancel feedback rejected");
                DdiError::from(e)
            })
    }

    /// Store attributes the device pushed.
    pub fn config_data(
        &self,
        tenant: &str,
        controller_id: &str,
        body: ConfigData,
        now: DateTime<Utc>,
    ) -> DdiResult<Target> {
        Ok(self
            .deployments
            .update_config_data(tenant, controller_id, body.mode, body.data, now)?)
    }

    fn ensure_target(&self, tenant: &str, controller_id: &str) -> DdiResult<Target> {
        self.deployments
            .store()
            .get_target(tenant, controller_id)?
            .ok_or_else(|| DdiError::TargetNotFound(controller_id.to_string()))
    }

    /// Load an action of this target, of the requested kind.
    fn device_action(
        &self,
        tenant: &str,
        controller_id: &str,
        action_id: ActionId,
        cancel: bool,
    ) -> DdiResult<Action> {
        self.ensure_target(tenant, controller_id)?;
        self.deployments
            .store()
            .get_action(tenant, action_id)?
            .filter(|a| a.controller_id == controller_id && a.is_cancel() == cancel)
            .ok_or(DdiError::ActionNotFound(action_id))
    }

    fn deployment_document(
        &self,
        action: &Action,
        history: Option<i64>,
        now: DateTime<Utc>,
    ) -> DdiResult<Tagged<DeploymentBase>> {
        let deployment = action
            .deployment()
            .ok_or(DdiError::ActionNotFound(action.id))?;
        let ds = self
            .deployments
            .store()
            .get_distribution_set(&action.tenant, deployment.distribution_set)?
            .ok_or(DdiError::DistributionSetNotFound(deployment.distribution_set))?;

        let window = handling::window_of(deployment);
        let download = handling::download_handling(deployment, now);
        let update = handling::update_handling(deployment, &window, now);
        let maintenance_window = handling::window_status(&window, now);

        let action_history = match history_limit(history) {
            Some(limit) => {
                let entries = self.deployments.history(action.id)?;
                Some(ActionHistory {
                    status: action.status,
                    messages: entries.iter().rev().take(limit).map(format_entry).collect(),
                })
            }
            None => None,
        };

        let etag = ETagBuilder::new("deployment")
            .part("action", (action.id, action.status))
            .part("distribution_set", (ds.id, &ds.version))
            .part("handling", (download, update, maintenance_window))
            .part("history", action_history.as_ref().map(|h| h.messages.len()))
            .part("history_head", action_history.as_ref().and_then(|h| h.messages.first()))
            .finish();

        Ok(Tagged {
            body: DeploymentBase {
                id: action.id.to_string(),
                deployment: DeploymentDirective {
                    download,
                    update,
                    maintenance_window,
                    chunks: ds.modules.iter().map(Chunk::from).collect(),
                },
                action_history,
            },
            etag,
        })
    }
}

/// The deployment a device should work on now.
///
/// Only one is active in single-assignment mode. With multi-assignment the
/// highest weight wins, then the oldest action. Deployments awaiting
/// cancellation are left to the cancel instruction.
fn current_deployment(actions: &[Action], multi_assignments: bool) -> Option<&Action> {
    let open = actions
        .iter()
        .filter(|a| a.active && !a.is_cancel() && a.status != Status::Canceling);
    if multi_assignments {
        open.min_by_key(|a| (Reverse(a.weight().unwrap_or(MAX_WEIGHT)), a.id))
    } else {
        open.min_by_key(|a| a.id)
    }
}

/// Number of status entries requested through `actionHistory`.
fn history_limit(requested: Option<i64>) -> Option<usize> {
    match requested {
        Some(-1) => Some(usize::MAX),
        Some(n) if n > 0 => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        _ => None,
    }
}

fn format_entry(entry: &ActionStatus) -> String {
    let status = serde_json::to_value(entry.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", entry.status));
    let stamp = entry.occurred_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    if entry.messages.is_empty() {
        format!("{stamp} {status}")
    } else {
        format!("{stamp} {status}: {}", entry.messages.join("; "))
    }
}

fn base_path(tenant: &str, controller_id: &str) -> String {
    format!("/{tenant}/controller/v1/{controller_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::TimeZone;
    use fleet_core::{ErrorKind, FleetConfig};
    use fleetgrid_deploy::{AssignOutcome, AssignmentRequest, Execution, FinishedResult};
    use fleetgrid_state::{DistributionSet, SoftwareModule, StateStore, TargetUpdateStatus};

    use crate::handling::{HandlingType, MaintenanceWindowStatus};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn gateway(config: FleetConfig) -> DdiGateway {
        let store = StateStore::open_in_memory().unwrap();
        let manager = DeploymentManager::new(store, Arc::new(config));
        for name in ["d1", "d2"] {
            manager
                .store()
                .create_distribution_set(DistributionSet {
                    id: 0,
                    tenant: "acme".to_string(),
                    name: name.to_string(),
                    version: "1.0".to_string(),
                    modules: vec![SoftwareModule {
                        part: "os".to_string(),
                        name: format!("{name}-os"),
                        version: "1.0".to_string(),
                        artifacts: vec![],
                    }],
                    created_at: at(0, 0),
                })
                .unwrap();
        }
        DdiGateway::new(manager)
    }

    fn assign(gw: &DdiGateway, request: AssignmentRequest, now: DateTime<Utc>) -> ActionId {
        match gw.deployments().assign("acme", "t1", &request, now).unwrap() {
            AssignOutcome::Assigned { action, .. } => action.id,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn href_id(link: &Option<Link>) -> Option<ActionId> {
        link.as_ref()
            .and_then(|l| l.href.rsplit('/').next())
            .and_then(|id| id.parse().ok())
    }

    #[test]
    fn first_poll_registers_target() {
        let gw = gateway(FleetConfig::default());
        let resp = gw.poll("acme", "t1", Some("10.0.0.1"), at(9, 0)).unwrap();
        assert_eq!(resp.body.config.polling.sleep, "00:05:00");
        assert!(resp.body.links.deployment_base.is_none());
        assert_eq!(
            resp.body.links.config_data,
            Some(Link::new("/acme/controller/v1/t1/configData"))
        );

        let target = gw.deployments().target("acme", "t1").unwrap();
        assert_eq!(target.created_by, "plug-and-play");
        assert_eq!(target.update_status, TargetUpdateStatus::Registered);
        assert_eq!(target.address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn poll_does_not_touch_audit_fields() {
        let gw = gateway(FleetConfig::default());
        gw.deployments()
            .create_target("acme", "t1", BTreeMap::new(), at(8, 0))
            .unwrap();
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();
        let target = gw.deployments().target("acme", "t1").unwrap();
        assert_eq!(target.created_by, "system");
        assert_eq!(target.created_at, at(8, 0));
        assert_eq!(target.last_poll_at, Some(at(9, 0)));
    }

    #[test]
    fn etag_follows_state() {
        let gw = gateway(FleetConfig::default());
        let first = gw.poll("acme", "t1", None, at(9, 0)).unwrap().etag;
        let again = gw.poll("acme", "t1", None, at(9, 1)).unwrap().etag;
        assert_eq!(first, again);

        assign(&gw, AssignmentRequest::forced(1), at(9, 2));
        let changed = gw.poll("acme", "t1", None, at(9, 3)).unwrap();
        assert_ne!(changed.etag, first);
        assert!(changed.body.links.deployment_base.is_some());
    }

    #[test]
    fn multi_assignment_exposes_highest_weight_first() {
        let mut config = FleetConfig::default();
        config.tenant_defaults.multi_assignments = true;
        let gw = gateway(config);
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();

        let a1 = assign(&gw, AssignmentRequest::forced(1).with_weight(56), at(9, 1));
        let a2 = assign(&gw, AssignmentRequest::forced(2).with_weight(34), at(9, 2));

        let resp = gw.poll("acme", "t1", None, at(9, 3)).unwrap();
        assert_eq!(href_id(&resp.body.links.deployment_base), Some(a1));

        gw.deployment_feedback(
            "acme",
            "t1",
            a1,
            ActionFeedback::new(Execution::Closed, FinishedResult::Success),
            at(9, 4),
        )
        .unwrap();

        let resp = gw.poll("acme", "t1", None, at(9, 5)).unwrap();
        assert_eq!(href_id(&resp.body.links.deployment_base), Some(a2));
        assert_eq!(href_id(&resp.body.links.installed_base), Some(a1));
    }

    #[test]
    fn single_assignment_exposes_cancel_separately() {
        let gw = gateway(FleetConfig::default());
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();
        let a1 = assign(&gw, AssignmentRequest::forced(1), at(9, 1));
        let c1 = gw.deployments().cancel("acme", a1, at(9, 2)).unwrap();

        let resp = gw.poll("acme", "t1", None, at(9, 3)).unwrap();
        assert!(resp.body.links.deployment_base.is_none());
        assert_eq!(href_id(&resp.body.links.cancel_action), Some(c1.id));

        let cancel = gw.cancel_action("acme", "t1", c1.id).unwrap();
        assert_eq!(cancel.body.cancel_action.stop_id, a1.to_string());

        // A deployment id is not a cancel action.
        assert!(matches!(
            gw.cancel_action("acme", "t1", a1),
            Err(DdiError::ActionNotFound(_))
        ));
    }

    #[test]
    fn maintenance_window_shortens_sleep() {
        let mut config = FleetConfig::default();
        config.tenant_defaults.min_polling_time = std::time::Duration::from_secs(60);
        let gw = gateway(config);
        gw.poll("acme", "t1", None, at(11, 0)).unwrap();
        let request = AssignmentRequest::forced(1).with_maintenance("0 0 12 * * *", "PT1H", "+00:00");
        assign(&gw, request, at(11, 0));

        let sleep = |now| gw.poll("acme", "t1", None, now).unwrap().body.config.polling.sleep;
        assert_eq!(sleep(at(11, 44)), "00:05:00");
        assert_eq!(sleep(at(11, 54)), "00:02:00");
        assert_eq!(sleep(at(11, 58)), "00:01:00");
        assert_eq!(sleep(at(12, 30)), "00:05:00");
    }

    #[test]
    fn deployment_base_respects_window() {
        let gw = gateway(FleetConfig::default());
        gw.poll("acme", "t1", None, at(11, 0)).unwrap();
        let request = AssignmentRequest::forced(1).with_maintenance("0 0 12 * * *", "PT1H", "+00:00");
        let a1 = assign(&gw, request, at(11, 0));

        let closed = gw.deployment_base("acme", "t1", a1, None, at(11, 30)).unwrap().body;
        assert_eq!(closed.deployment.download, HandlingType::Forced);
        assert_eq!(closed.deployment.update, HandlingType::Skip);
        assert_eq!(
            closed.deployment.maintenance_window,
            Some(MaintenanceWindowStatus::Unavailable)
        );
        assert_eq!(closed.deployment.chunks[0].name, "d1-os");

        let open = gw.deployment_base("acme", "t1", a1, None, at(12, 30)).unwrap().body;
        assert_eq!(open.deployment.update, HandlingType::Forced);
        assert_eq!(open.deployment.maintenance_window, Some(MaintenanceWindowStatus::Available));
    }

    #[test]
    fn action_history_is_bounded() {
        let gw = gateway(FleetConfig::default());
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();
        let a1 = assign(&gw, AssignmentRequest::forced(1), at(9, 0));
        for execution in [Execution::Download, Execution::Downloaded] {
            gw.deployment_feedback("acme", "t1", a1, ActionFeedback::new(execution, FinishedResult::None), at(9, 1))
                .unwrap();
        }

        let history = |n| {
            gw.deployment_base("acme", "t1", a1, n, at(9, 2))
                .unwrap()
                .body
                .action_history
                .map(|h| h.messages.len())
        };
        assert_eq!(history(None), None);
        assert_eq!(history(Some(0)), None);
        assert_eq!(history(Some(-5)), None);
        assert_eq!(history(Some(2)), Some(2));
        assert_eq!(history(Some(-1)), Some(3));
        assert_eq!(history(Some(i64::MAX)), Some(3));

        let newest = gw.deployment_base("acme", "t1", a1, Some(1), at(9, 2)).unwrap();
        let messages = newest.body.action_history.unwrap().messages;
        assert!(messages[0].contains("DOWNLOADED"), "{messages:?}");
    }

    #[test]
    fn installed_base_requires_finished_action() {
        let gw = gateway(FleetConfig::default());
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();
        let a1 = assign(&gw, AssignmentRequest::forced(1), at(9, 0));
        let err = gw.installed_base("acme", "t1", a1, None, at(9, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        gw.deployment_feedback(
            "acme",
            "t1",
            a1,
            ActionFeedback::new(Execution::Closed, FinishedResult::Success),
            at(9, 2),
        )
        .unwrap();
        let doc = gw.installed_base("acme", "t1", a1, None, at(9, 3)).unwrap();
        assert_eq!(doc.body.id, a1.to_string());
    }

    #[test]
    fn foreign_actions_are_hidden() {
        let gw = gateway(FleetConfig::default());
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();
        gw.poll("acme", "t2", None, at(9, 0)).unwrap();
        let a1 = assign(&gw, AssignmentRequest::forced(1), at(9, 0));

        let err = gw.deployment_base("acme", "t2", a1, None, at(9, 1)).unwrap_err();
        assert!(matches!(err, DdiError::ActionNotFound(_)));
        let err = gw
            .deployment_feedback(
                "acme",
                "t2",
                a1,
                ActionFeedback::new(Execution::Closed, FinishedResult::Success),
                at(9, 1),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = gw.deployment_base("acme", "ghost", a1, None, at(9, 1)).unwrap_err();
        assert!(matches!(err, DdiError::TargetNotFound(_)));
    }

    #[test]
    fn config_data_clears_request() {
        let gw = gateway(FleetConfig::default());
        gw.poll("acme", "t1", None, at(9, 0)).unwrap();
        let body: ConfigData = serde_json::from_str(r#"{"mode": "merge", "data": {"hw": "rev2"}}"#).unwrap();
        let target = gw.config_data("acme", "t1", body, at(9, 1)).unwrap();
        assert_eq!(target.attributes.get("hw").map(String::as_str), Some("rev2"));

        let resp = gw.poll("acme", "t1", None, at(9, 2)).unwrap();
        assert!(resp.body.links.config_data.is_none());
    }
}
