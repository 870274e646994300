//! Action state machine.
//!
//! All functions here are pure: they take the current action(s) and return
//! the updated copies plus the events the change implies. Persisting the
//! result and reacting to the events is the caller's job.

use chrono::{DateTime, Utc};
use fleetgrid_state::{Action, ActionId, ActionKind, DistributionSetId, Status};
use tracing::debug;

use crate::error::{DeployError, DeployResult};
use crate::feedback::{Execution, Feedback, FinishedResult};

/// Something that happened to an action and may concern other records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    StatusChanged {
        action_id: ActionId,
        from: Status,
        to: Status,
    },
    DeploymentFinished {
        action_id: ActionId,
        distribution_set: DistributionSetId,
    },
    DeploymentFailed {
        action_id: ActionId,
        distribution_set: DistributionSetId,
    },
    /// A deployment closed on its own while a cancellation was pending.
    CancelSuperseded { action_id: ActionId },
    CancelRequested {
        action_id: ActionId,
        cancel_action_id: ActionId,
    },
    /// The device confirmed the cancellation; `action_id` is the original.
    CancelConfirmed {
        action_id: ActionId,
        cancel_action_id: ActionId,
    },
    CancelRejected {
        action_id: ActionId,
        cancel_action_id: ActionId,
    },
}

/// Result of applying one step to an action.
#[derive(Debug, Clone)]
pub struct Transition {
    pub action: Action,
    /// Status recorded in the action's log for this step.
    pub logged: Status,
    pub events: Vec<DomainEvent>,
}

impl Transition {
    fn unchanged(action: &Action, logged: Status) -> Self {
        Self {
            action: action.clone(),
            logged,
            events: Vec::new(),
        }
    }

    fn moved(action: &Action, to: Status, active: bool, now: DateTime<Utc>) -> Self {
        let mut next = action.clone();
        next.status = to;
        next.active = active;
        next.last_modified_at = now;
        let mut events = Vec::new();
        if action.status != to {
            events.push(DomainEvent::StatusChanged {
                action_id: action.id,
                from: action.status,
                to,
            });
        }
        Self {
            action: next,
            logged: to,
            events,
        }
    }
}

/// Reject anything addressed to an action that is already closed.
pub fn ensure_open(action: &Action) -> DeployResult<()> {
    if action.status.is_terminal() || !action.active {
        return Err(DeployError::ActionClosed {
            action_id: action.id,
            status: action.status,
        });
    }
    Ok(())
}

/// Apply device feedback to an action.
pub fn apply(action: &Action, feedback: &Feedback, now: DateTime<Utc>) -> DeployResult<Transition> {
    ensure_open(action)?;
    let transition = match &action.kind {
        ActionKind::Deployment(deployment) => {
            apply_deployment(action, deployment.distribution_set, feedback, now)
        }
        ActionKind::Cancel { cancels } => apply_cancel(action, *cancels, feedback, now),
    };
    debug!(
        action_id = action.id,
        execution = ?feedback.execution,
        from = ?action.status,
        to = ?transition.action.status,
        "feedback applied"
    );
    Ok(transition)
}

fn apply_deployment(
    action: &Action,
    distribution_set: DistributionSetId,
    feedback: &Feedback,
    now: DateTime<Utc>,
) -> Transition {
    let reported = match feedback.execution {
        Execution::Closed => {
            let (status, event) = match feedback.finished {
                FinishedResult::Failure => (
                    Status::Error,
                    DomainEvent::DeploymentFailed {
                        action_id: action.id,
                        distribution_set,
                    },
                ),
                FinishedResult::Success | FinishedResult::None => (
                    Status::Finished,
                    DomainEvent::DeploymentFinished {
                        action_id: action.id,
                        distribution_set,
                    },
                ),
            };
            let mut transition = Transition::moved(action, status, false, now);
            transition.events.push(event);
            if action.status == Status::Canceling {
                transition.events.push(DomainEvent::CancelSuperseded {
                    action_id: action.id,
                });
            }
            return transition;
        }
        // Informational only.
        Execution::Canceled => return Transition::unchanged(action, action.status),
        Execution::Scheduled => Status::Scheduled,
        Execution::Proceeding | Execution::Resumed => Status::Running,
        Execution::Download => Status::Download,
        Execution::Downloaded => Status::Downloaded,
        Execution::Retrieved => Status::Retrieved,
        Execution::Rejected => Status::Warning,
    };

    // A pending cancellation is only resolved through the cancel-action.
    if action.status == Status::Canceling {
        return Transition::unchanged(action, reported);
    }
    Transition::moved(action, reported, true, now)
}

fn apply_cancel(
    action: &Action,
    original: ActionId,
    feedback: &Feedback,
    now: DateTime<Utc>,
) -> Transition {
    match feedback.execution {
        Execution::Closed => {
            let mut transition = Transition::moved(action, Status::Canceled, false, now);
            transition.events.push(DomainEvent::CancelConfirmed {
                action_id: original,
                cancel_action_id: action.id,
            });
            transition
        }
        Execution::Rejected => Transition::unchanged(action, Status::CancelRejected),
        Execution::Canceled => Transition::unchanged(action, Status::Canceled),
        Execution::Scheduled => Transition::unchanged(action, Status::Scheduled),
        Execution::Download => Transition::unchanged(action, Status::Download),
        Execution::Downloaded => Transition::unchanged(action, Status::Downloaded),
        Execution::Retrieved => Transition::unchanged(action, Status::Retrieved),
        Execution::Proceeding | Execution::Resumed => {
            Transition::unchanged(action, Status::Running)
        }
    }
}

/// Put a running deployment into `CANCELING` and build its cancel-action.
///
/// Returns the transition of the original and the new cancel-action.
pub fn request_cancel(
    original: &Action,
    cancel_action_id: ActionId,
    now: DateTime<Utc>,
) -> DeployResult<(Transition, Action)> {
    ensure_open(original)?;
    if original.is_cancel() || original.status == Status::Canceling {
        return Err(DeployError::NotCancelable(original.id));
    }

    let mut transition = Transition::moved(original, Status::Canceling, true, now);
    transition.events.push(DomainEvent::CancelRequested {
        action_id: original.id,
        cancel_action_id,
    });

    let cancel = Action {
        id: cancel_action_id,
        tenant: original.tenant.clone(),
        controller_id: original.controller_id.clone(),
        kind: ActionKind::Cancel {
            cancels: original.id,
        },
        status: Status::Running,
        active: true,
        rollout: original.rollout,
        created_at: now,
        last_modified_at: now,
    };
    Ok((transition, cancel))
}

/// Close the original of a confirmed cancellation for good.
pub fn confirm_cancel(original: &Action, now: DateTime<Utc>) -> Transition {
    Transition::moved(original, Status::Canceled, false, now)
}

/// Administrative rejection of a pending cancellation.
///
/// The cancel-action ends in `CANCEL_REJECTED`; the original resumes as
/// `RUNNING`.
pub fn reject_cancel(
    cancel: &Action,
    original: &Action,
    now: DateTime<Utc>,
) -> DeployResult<(Transition, Transition)> {
    ensure_open(cancel)?;
    let mut cancel_transition = Transition::moved(cancel, Status::CancelRejected, false, now);
    cancel_transition.events.push(DomainEvent::CancelRejected {
        action_id: original.id,
        cancel_action_id: cancel.id,
    });

    let original_transition = if original.active && original.status == Status::Canceling {
        Transition::moved(original, Status::Running, true, now)
    } else {
        Transition::unchanged(original, original.status)
    };
    Ok((cancel_transition, original_transition))
}

/// Retire a cancel-action whose original closed before the device confirmed.
pub fn supersede_cancel(cancel: &Action, now: DateTime<Utc>) -> Transition {
    Transition::moved(cancel, Status::Finished, false, now)
}
