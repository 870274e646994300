//! Group action counts and threshold evaluation.

use std::collections::BTreeMap;

use fleetgrid_state::{Action, ConditionKind, GroupCondition, Status};
use serde::Serialize;

use crate::error::{RolloutError, RolloutResult};

/// Coarse state of one group member's deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountState {
    /// No action exists for the target (yet).
    NotStarted,
    Scheduled,
    Running,
    Finished,
    Error,
    Cancelled,
}

impl CountState {
    fn of(status: Status) -> Self {
        match status {
            Status::Finished => CountState::Finished,
            Status::Error => CountState::Error,
            Status::Canceled => CountState::Cancelled,
            Status::Scheduled => CountState::Scheduled,
            _ => CountState::Running,
        }
    }
}

/// Per-state action counts over a fixed target total.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TotalTargetCountStatus {
    pub total: u64,
    pub counts: BTreeMap<CountState, u64>,
}

impl TotalTargetCountStatus {
    /// Count group members by the status of the deployment covering them.
    /// Members without one count as not started.
    pub fn from_members(total: u64, members: &[Option<Action>]) -> Self {
        let mut counts = BTreeMap::new();
        let mut seen = 0u64;
        for action in members.iter().flatten() {
            *counts.entry(CountState::of(action.status)).or_insert(0) += 1;
            seen += 1;
        }
        let not_started = total.saturating_sub(seen);
        if not_started > 0 {
            counts.insert(CountState::NotStarted, not_started);
        }
        Self { total, counts }
    }

    /// No member of a started group has a deployment still in flight.
    ///
    /// Members that were never started cannot progress once the group
    /// runs, so they do not hold the group open.
    pub fn is_complete(&self) -> bool {
        self.count(CountState::Scheduled) == 0 && self.count(CountState::Running) == 0
    }

    pub fn count(&self, state: CountState) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    /// Element-wise sum, used for rollout-level totals.
    pub fn merge(&mut self, other: &TotalTargetCountStatus) {
        self.total += other.total;
        for (state, n) in &other.counts {
            *self.counts.entry(*state).or_insert(0) += n;
        }
    }
}

/// Parse a threshold expression: an integer percentage, optionally
/// followed by `%`.
pub fn parse_threshold(condition: &GroupCondition) -> RolloutResult<u64> {
    let ConditionKind::Threshold = condition.kind;
    let raw = condition.expression.trim();
    let digits = raw.strip_suffix('%').unwrap_or(raw).trim();
    let invalid = |reason: &str| RolloutError::InvalidCondition {
        expression: condition.expression.clone(),
        reason: reason.to_string(),
    };
    let percent: u64 = digits.parse().map_err(|_| invalid("not an integer percentage"))?;
    if percent > 100 {
        return Err(invalid("percentage above 100"));
    }
    Ok(percent)
}

fn ratio_reached(count: u64, total: u64, percent: u64) -> bool {
    count * 100 >= percent * total
}

/// Whether enough of the group finished successfully.
pub fn success_reached(
    condition: &GroupCondition,
    status: &TotalTargetCountStatus,
) -> RolloutResult<bool> {
    let percent = parse_threshold(condition)?;
    Ok(ratio_reached(status.count(CountState::Finished), status.total, percent))
}

/// Whether enough of the group failed. Never true without at least one error.
pub fn error_reached(
    condition: &GroupCondition,
    status: &TotalTargetCountStatus,
) -> RolloutResult<bool> {
    let percent = parse_threshold(condition)?;
    let errors = status.count(CountState::Error);
    Ok(errors > 0 && ratio_reached(errors, status.total, percent))
}
