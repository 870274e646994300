//! Periodic progression of running rollouts.
//!
//! Each tick looks at every rollout once:
//!
//! - READY rollouts whose `start_at` has passed are started.
//! - RUNNING rollouts get one group evaluation: the first group that is
//!   neither FINISHED nor ERROR is either started (actions created for all
//!   its targets) or checked against its error and success conditions.
//! - DELETING leftovers are purged.
//!
//! Every evaluation runs in its own write transaction and moves groups and
//! rollouts with compare-and-swap transitions, so overlapping ticks never
//! advance a group twice.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::TenantConfig;
use fleetgrid_deploy::assign::assign_in;
use fleetgrid_deploy::{AssignOutcome, AssignmentRequest, DeployError};
use fleetgrid_state::{
    ErrorAction, Rollout, RolloutGroup, RolloutGroupStatus, RolloutId, RolloutRef, RolloutStatus,
    SuccessAction, WriteTxn,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::condition::{TotalTargetCountStatus, error_reached, success_reached};
use crate::error::{RolloutError, RolloutResult};
use crate::manager::{RolloutManager, start_in};

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub purged: usize,
}

#[derive(Clone)]
pub struct RolloutScheduler {
    rollouts: RolloutManager,
}

impl RolloutScheduler {
    pub fn new(rollouts: RolloutManager) -> Self {
        Self { rollouts }
    }

    /// Run one pass over all rollouts. Failures of individual rollouts are
    /// logged and counted, never propagated.
    pub fn tick(&self, now: DateTime<Utc>) -> RolloutResult<TickReport> {
        let mut report = TickReport::default();
        for rollout in self.rollouts.store().list_rollouts(None)? {
            let result = match rollout.status {
                RolloutStatus::Ready if rollout.start_at.is_some_and(|at| at <= now) => {
                    self.auto_start(&rollout).map(|started| {
                        report.started += usize::from(started);
                    })
                }
                RolloutStatus::Running => self.evaluate(rollout.id, now).map(|()| {
                    report.evaluated += 1;
                }),
                RolloutStatus::Deleting => self.rollouts.purge(rollout.id).map(|purged| {
                    report.purged += usize::from(purged);
                }),
                _ => continue,
            };

            if let Err(e) = result {
                report.failed += 1;
                self.handle_failure(&rollout, &e);
            }
        }
        Ok(report)
    }

    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "rollout scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.tick(Utc::now()) {
                        Ok(report) if report != TickReport::default() => {
                            debug!(
                                started = report.started,
                                evaluated = report.evaluated,
                                failed = report.failed,
                                purged = report.purged,
                                "rollout scheduler tick"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "rollout scheduler tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }

    fn auto_start(&self, rollout: &Rollout) -> RolloutResult<bool> {
        let started = self
            .rollouts
            .store()
            .write(|txn| start_in(txn, rollout.id))?;
        if started {
            info!(tenant = %rollout.tenant, rollout_id = rollout.id, "rollout started on schedule");
        }
        Ok(started)
    }

    fn handle_failure(&self, rollout: &Rollout, e: &RolloutError) {
        if !matches!(e, RolloutError::InvalidCondition { .. }) {
            warn!(tenant = %rollout.tenant, rollout_id = rollout.id, error = %e, "rollout evaluation failed");
            return;
        }
        error!(tenant = %rollout.tenant, rollout_id = rollout.id, error = %e, "rollout has a malformed condition");
        let moved = self.rollouts.store().write(|txn| {
            txn.transition_rollout(rollout.id, &[RolloutStatus::Running], RolloutStatus::Error)
        });
        if let Err(e) = moved {
            warn!(rollout_id = rollout.id, error = %e, "failed to mark rollout as errored");
        }
    }

    /// One group evaluation for a RUNNING rollout.
    fn evaluate(&self, rollout_id: RolloutId, now: DateTime<Utc>) -> RolloutResult<()> {
        self.rollouts.store().write(|txn| {
            let Some(rollout) = txn.rollout_by_id(rollout_id)? else {
                return Ok(());
            };
            if rollout.status != RolloutStatus::Running {
                return Ok(());
            }
            let config = self.rollouts.tenant_config(&rollout.tenant);
            let groups = txn.groups_of(rollout_id)?;

            if let Some(group) = groups.iter().find(|g| !g.status.is_settled()) {
                match group.status {
                    RolloutGroupStatus::Running => {
                        evaluate_running(txn, config, &rollout, group, &groups, now)?;
                    }
                    _ => {
                        start_group(txn, config, &rollout, group, now)?;
                    }
                }
            }

            let groups = txn.groups_of(rollout_id)?;
            if groups.iter().all(|g| g.status.is_settled()) {
                let status = if groups.iter().any(|g| g.status == RolloutGroupStatus::Error) {
                    RolloutStatus::Error
                } else {
                    RolloutStatus::Finished
                };
                if txn.transition_rollout(rollout_id, &[RolloutStatus::Running], status)? {
                    info!(tenant = %rollout.tenant, rollout_id, status = ?status, "rollout completed");
                }
            }

            if let Some(mut latest) = txn.rollout_by_id(rollout_id)? {
                latest.last_check = Some(now);
                txn.put_rollout(&latest)?;
            }
            Ok(())
        })
    }
}

/// Create the group's deployment actions and move it to RUNNING. A group
/// without targets finishes immediately.
fn start_group(
    txn: &WriteTxn,
    config: &TenantConfig,
    rollout: &Rollout,
    group: &RolloutGroup,
    now: DateTime<Utc>,
) -> RolloutResult<()> {
    let startable = [
        RolloutGroupStatus::Creating,
        RolloutGroupStatus::Ready,
        RolloutGroupStatus::Scheduled,
    ];
    if group.total_targets == 0 {
        if txn.transition_group(group.id, &startable, RolloutGroupStatus::Finished)? {
            info!(rollout_id = rollout.id, group = %group.name, "empty rollout group finished");
        }
        return Ok(());
    }
    if !txn.transition_group(group.id, &startable, RolloutGroupStatus::Running)? {
        return Ok(());
    }

    let request = AssignmentRequest {
        distribution_set: rollout.distribution_set,
        action_type: rollout.action_type,
        forced_time: rollout.forced_time,
        weight: rollout.weight.map(u32::from),
        maintenance: None,
    };
    let membership = RolloutRef {
        rollout_id: rollout.id,
        group_id: group.id,
    };

    let mut created = 0usize;
    for controller_id in txn.group_targets(group.id)? {
        match assign_in(txn, config, &rollout.tenant, &controller_id, &request, Some(membership), now) {
            Ok(AssignOutcome::Assigned { .. }) => created += 1,
            Ok(AssignOutcome::AlreadyAssigned { action_id }) => {
                debug!(%controller_id, action_id, "target already runs the rollout's distribution set");
            }
            Err(DeployError::TargetNotFound(_)) => {
                warn!(%controller_id, rollout_id = rollout.id, "rollout target no longer exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        tenant = %rollout.tenant,
        rollout_id = rollout.id,
        group = %group.name,
        actions = created,
        "rollout group started"
    );
    Ok(())
}

fn evaluate_running(
    txn: &WriteTxn,
    config: &TenantConfig,
    rollout: &Rollout,
    group: &RolloutGroup,
    groups: &[RolloutGroup],
    now: DateTime<Utc>,
) -> RolloutResult<()> {
    let members = txn.group_member_actions(&rollout.tenant, group.id, rollout.distribution_set)?;
    let counts = TotalTargetCountStatus::from_members(group.total_targets, &members);

    if let Some(condition) = &group.error_condition {
        if error_reached(condition, &counts)? {
            return fail_group(txn, rollout, group, &counts);
        }
    }

    if !success_reached(&group.success_condition, &counts)? {
        if counts.is_complete() {
            return fail_group(txn, rollout, group, &counts);
        }
        return Ok(());
    }
    if !txn.transition_group(group.id, &[RolloutGroupStatus::Running], RolloutGroupStatus::Finished)? {
        return Ok(());
    }
    info!(
        tenant = %rollout.tenant,
        rollout_id = rollout.id,
        group = %group.name,
        "rollout group finished"
    );

    match group.success_action {
        SuccessAction::Nextgroup => {
            let next = groups
                .iter()
                .find(|g| g.position > group.position && !g.status.is_settled());
            if let Some(next) = next {
                start_group(txn, config, rollout, next, now)?;
            }
        }
        SuccessAction::Pause => {
            txn.transition_rollout(rollout.id, &[RolloutStatus::Running], RolloutStatus::Paused)?;
        }
    }
    Ok(())
}

/// Move a running group to `ERROR` and apply its error action.
fn fail_group(
    txn: &WriteTxn,
    rollout: &Rollout,
    group: &RolloutGroup,
    counts: &TotalTargetCountStatus,
) -> RolloutResult<()> {
    if !txn.transition_group(group.id, &[RolloutGroupStatus::Running], RolloutGroupStatus::Error)? {
        return Ok(());
    }
    warn!(
        tenant = %rollout.tenant,
        rollout_id = rollout.id,
        group = %group.name,
        counts = ?counts.counts,
        "rollout group failed"
    );
    match group.error_action.unwrap_or(ErrorAction::Pause) {
        ErrorAction::Pause => {
            txn.transition_rollout(rollout.id, &[RolloutStatus::Running], RolloutStatus::Paused)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::TimeZone;
    use fleet_core::FleetConfig;
    use fleetgrid_deploy::{DeploymentManager, Execution, Feedback, FinishedResult};
    use fleetgrid_state::{DistributionSet, GroupCondition, StateStore, Status};

    use crate::condition::CountState;
    use crate::manager::RolloutCreate;
    use crate::selector::StoreTargetSelector;

    struct Fixture {
        deployments: DeploymentManager,
        rollouts: RolloutManager,
        scheduler: RolloutScheduler,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn fixture(targets: usize) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let config = Arc::new(FleetConfig::default());
        let deployments = DeploymentManager::new(store.clone(), config.clone());
        store
            .create_distribution_set(DistributionSet {
                id: 0,
                tenant: "acme".to_string(),
                name: "firmware".to_string(),
                version: "2.0".to_string(),
                modules: vec![],
                created_at: now(),
            })
            .unwrap();
        for i in 0..targets {
            deployments
                .create_target("acme", &format!("dev-{i}"), BTreeMap::new(), now())
                .unwrap();
        }
        let selector = Arc::new(StoreTargetSelector::new(store.clone()));
        let rollouts = RolloutManager::new(store, config, selector);
        let scheduler = RolloutScheduler::new(rollouts.clone());
        Fixture {
            deployments,
            rollouts,
            scheduler,
        }
    }

    impl Fixture {
        fn report(&self, rollout_id: RolloutId, position: usize, finished: FinishedResult) {
            let group_id = self.rollouts.get("acme", rollout_id).unwrap().groups[position].id;
            let actions = self
                .rollouts
                .store()
                .read(|txn| txn.actions_of(group_id))
                .unwrap();
            for action in actions {
                self.deployments
                    .deployment_feedback(
                        "acme",
                        &action.controller_id,
                        action.id,
                        &Feedback::new(Execution::Closed, finished),
                        now(),
                    )
                    .unwrap();
            }
        }

        fn statuses(&self, rollout_id: RolloutId) -> (RolloutStatus, Vec<RolloutGroupStatus>) {
            let detail = self.rollouts.get("acme", rollout_id).unwrap();
            (
                detail.rollout.status,
                detail.groups.iter().map(|g| g.status).collect(),
            )
        }
    }

    use RolloutGroupStatus as G;

    #[test]
    fn groups_progress_in_order() {
        let f = fixture(4);
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("wave", "*", 1, 2), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts.start("acme", id).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Running, vec![G::Scheduled, G::Scheduled]));

        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id).1, vec![G::Running, G::Scheduled]);
        let actions = f.deployments.actions("acme", "dev-0").unwrap();
        assert_eq!(actions.len(), 1);
        assert!(actions[0].rollout.is_some());
        assert!(f.deployments.actions("acme", "dev-2").unwrap().is_empty());

        // Nothing reported yet: the group stays running.
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id).1, vec![G::Running, G::Scheduled]);

        f.report(id, 0, FinishedResult::Success);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id).1, vec![G::Finished, G::Running]);
        assert_eq!(f.deployments.actions("acme", "dev-3").unwrap().len(), 1);

        f.report(id, 1, FinishedResult::Success);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Finished, vec![G::Finished, G::Finished]));

        let rollout = f.rollouts.get("acme", id).unwrap().rollout;
        assert_eq!(rollout.last_check, Some(now()));
    }

    #[test]
    fn error_threshold_pauses_rollout() {
        let f = fixture(4);
        let mut request = RolloutCreate::new("risky", "*", 1, 2);
        request.error_condition = Some(GroupCondition::threshold("50"));
        let id = f.rollouts.create("acme", &request, now()).unwrap().rollout.id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();

        f.report(id, 0, FinishedResult::Failure);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Paused, vec![G::Error, G::Scheduled]));

        // Paused rollouts are left alone.
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Paused, vec![G::Error, G::Scheduled]));

        // After resuming, the failed group is skipped.
        f.rollouts.resume("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id).1, vec![G::Error, G::Running]);

        f.report(id, 1, FinishedResult::Success);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Error, vec![G::Error, G::Finished]));
    }

    #[test]
    fn error_is_checked_before_success() {
        let f = fixture(2);
        let mut request = RolloutCreate::new("split", "*", 1, 1);
        request.success_condition = GroupCondition::threshold("50");
        request.error_condition = Some(GroupCondition::threshold("50"));
        let id = f.rollouts.create("acme", &request, now()).unwrap().rollout.id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();

        let actions = f.deployments.actions("acme", "dev-0").unwrap();
        f.deployments
            .deployment_feedback("acme", "dev-0", actions[0].id, &Feedback::new(Execution::Closed, FinishedResult::Success), now())
            .unwrap();
        let actions = f.deployments.actions("acme", "dev-1").unwrap();
        f.deployments
            .deployment_feedback("acme", "dev-1", actions[0].id, &Feedback::new(Execution::Closed, FinishedResult::Failure), now())
            .unwrap();

        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Paused, vec![G::Error]));
    }

    #[test]
    fn already_assigned_member_counts_by_existing_action() {
        let f = fixture(2);
        let direct = match f
            .deployments
            .assign("acme", "dev-0", &AssignmentRequest::forced(1), now())
            .unwrap()
        {
            AssignOutcome::Assigned { action, .. } => action,
            other => panic!("unexpected outcome: {other:?}"),
        };
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("overlap", "*", 1, 1), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();

        // dev-0 keeps its direct assignment; only dev-1 gets a group action.
        assert_eq!(f.deployments.actions("acme", "dev-0").unwrap().len(), 1);
        f.report(id, 0, FinishedResult::Success);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id).1, vec![G::Running]);

        f.deployments
            .deployment_feedback(
                "acme",
                "dev-0",
                direct.id,
                &Feedback::new(Execution::Closed, FinishedResult::Success),
                now(),
            )
            .unwrap();
        f.scheduler.tick(now()).unwrap();
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Finished, vec![G::Finished]));

        let counts = f.rollouts.group_counts("acme", id).unwrap();
        assert_eq!(counts[0].counts.count(CountState::Finished), 2);
        assert_eq!(counts[0].counts.count(CountState::NotStarted), 0);
    }

    #[test]
    fn settled_group_below_success_fails() {
        let f = fixture(2);
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("doomed", "*", 1, 2), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();

        // No error condition configured, and nothing is left in flight.
        f.report(id, 0, FinishedResult::Failure);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Paused, vec![G::Error, G::Scheduled]));

        f.rollouts.resume("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id).1, vec![G::Error, G::Running]);

        f.report(id, 1, FinishedResult::Failure);
        f.scheduler.tick(now()).unwrap();
        f.rollouts.resume("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Error, vec![G::Error, G::Error]));
    }

    #[test]
    fn pause_success_action() {
        let f = fixture(2);
        let mut request = RolloutCreate::new("careful", "*", 1, 2);
        request.success_action = SuccessAction::Pause;
        let id = f.rollouts.create("acme", &request, now()).unwrap().rollout.id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();
        f.report(id, 0, FinishedResult::Success);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(f.statuses(id), (RolloutStatus::Paused, vec![G::Finished, G::Scheduled]));
    }

    #[test]
    fn empty_groups_finish_without_actions() {
        let f = fixture(1);
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("sparse", "*", 1, 3), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();
        f.report(id, 0, FinishedResult::Success);
        f.scheduler.tick(now()).unwrap();
        // The next group was started by the success action and is empty.
        assert_eq!(f.statuses(id).1, vec![G::Finished, G::Finished, G::Scheduled]);
        f.scheduler.tick(now()).unwrap();
        assert_eq!(
            f.statuses(id),
            (RolloutStatus::Finished, vec![G::Finished, G::Finished, G::Finished])
        );
    }

    #[test]
    fn start_at_triggers_auto_start() {
        let f = fixture(2);
        let mut request = RolloutCreate::new("later", "*", 1, 1);
        request.start_at = Some(now() + chrono::Duration::hours(1));
        let id = f.rollouts.create("acme", &request, now()).unwrap().rollout.id;

        let report = f.scheduler.tick(now()).unwrap();
        assert_eq!(report.started, 0);
        assert_eq!(f.statuses(id).0, RolloutStatus::Ready);

        let report = f.scheduler.tick(now() + chrono::Duration::hours(2)).unwrap();
        assert_eq!(report.started, 1);
        assert_eq!(f.statuses(id), (RolloutStatus::Running, vec![G::Scheduled]));
    }

    #[test]
    fn malformed_condition_errors_rollout() {
        let f = fixture(2);
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("broken", "*", 1, 1), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();

        let mut group = f.rollouts.get("acme", id).unwrap().groups.remove(0);
        group.success_condition = GroupCondition::threshold("most");
        f.rollouts.store().write(|txn| txn.put_group(&group)).unwrap();

        let report = f.scheduler.tick(now()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.statuses(id).0, RolloutStatus::Error);
    }

    #[test]
    fn stopped_rollout_cancels_running_actions() {
        let f = fixture(2);
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("halt", "*", 1, 1), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts.start("acme", id).unwrap();
        f.scheduler.tick(now()).unwrap();

        f.rollouts.stop("acme", id, now()).unwrap();
        let actions = f.deployments.actions("acme", "dev-0").unwrap();
        assert!(actions.iter().any(|a| a.status == Status::Canceling));
        assert!(actions.iter().any(|a| a.is_cancel()));

        // Stopped rollouts are not progressed.
        let report = f.scheduler.tick(now()).unwrap();
        assert_eq!(report.evaluated, 0);
    }

    #[test]
    fn deleting_leftover_is_purged() {
        let f = fixture(1);
        let id = f
            .rollouts
            .create("acme", &RolloutCreate::new("gone", "*", 1, 1), now())
            .unwrap()
            .rollout
            .id;
        f.rollouts
            .store()
            .write(|txn| txn.transition_rollout(id, &[RolloutStatus::Ready], RolloutStatus::Deleting))
            .unwrap();
        let report = f.scheduler.tick(now()).unwrap();
        assert_eq!(report.purged, 1);
        assert!(f.rollouts.list("acme").unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let f = fixture(0);
        let (tx, rx) = watch::channel(false);
        let scheduler = f.scheduler.clone();
        let handle = tokio::spawn(async move {
            scheduler.run(Duration::from_millis(10), rx).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
