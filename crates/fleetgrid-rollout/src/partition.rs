//! Splitting a rollout's targets into ordered groups.

use fleetgrid_state::GroupCondition;
use serde::{Deserialize, Serialize};

use crate::error::{RolloutError, RolloutResult};

/// An explicitly sized group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    #[serde(default)]
    pub name: Option<String>,
    /// Share of the targets still unassigned when this group is filled.
    pub target_percentage: f64,
    /// Overrides the rollout's default success condition.
    #[serde(default)]
    pub success_condition: Option<GroupCondition>,
    #[serde(default)]
    pub error_condition: Option<GroupCondition>,
}

impl GroupDefinition {
    pub fn percent(target_percentage: f64) -> Self {
        Self {
            name: None,
            target_percentage,
            success_condition: None,
            error_condition: None,
        }
    }
}

/// How the selected targets are divided.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupPlan {
    /// `n` groups whose sizes differ by at most one.
    Amount(u32),
    Explicit(Vec<GroupDefinition>),
}

impl GroupPlan {
    pub fn group_count(&self) -> usize {
        match self {
            GroupPlan::Amount(n) => *n as usize,
            GroupPlan::Explicit(groups) => groups.len(),
        }
    }
}

/// Upper bounds a partition must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLimits {
    pub max_groups: u32,
    pub max_per_group: u32,
}

/// Partition `targets` (sorted by controller id) according to `plan`.
///
/// Fails if the plan asks for more than `max_groups` groups or any group
/// would exceed `max_per_group`.
pub fn partition(
    mut targets: Vec<String>,
    plan: &GroupPlan,
    limits: PartitionLimits,
) -> RolloutResult<Vec<Vec<String>>> {
    let PartitionLimits {
        max_groups,
        max_per_group,
    } = limits;
    if plan.group_count() > max_groups as usize {
        return Err(RolloutError::InvalidDefinition(format!(
            "{} groups exceed the limit of {max_groups}",
            plan.group_count()
        )));
    }
    targets.sort();
    targets.dedup();

    let sizes = match plan {
        GroupPlan::Amount(0) => {
            return Err(RolloutError::InvalidDefinition(
                "amount_groups must be positive".to_string(),
            ));
        }
        GroupPlan::Amount(n) => even_sizes(targets.len(), *n as usize),
        GroupPlan::Explicit(groups) => percentage_sizes(targets.len(), groups)?,
    };

    if let Some(size) = sizes.iter().find(|s| **s > max_per_group as usize) {
        return Err(RolloutError::InvalidDefinition(format!(
            "group of {size} targets exceeds the limit of {max_per_group}"
        )));
    }

    let mut rest = targets.into_iter();
    Ok(sizes
        .into_iter()
        .map(|size| rest.by_ref().take(size).collect())
        .collect())
}

fn even_sizes(total: usize, groups: usize) -> Vec<usize> {
    let base = total / groups;
    let extra = total % groups;
    (0..groups).map(|i| base + usize::from(i < extra)).collect()
}

fn percentage_sizes(total: usize, groups: &[GroupDefinition]) -> RolloutResult<Vec<usize>> {
    if groups.is_empty() {
        return Err(RolloutError::InvalidDefinition(
            "at least one group is required".to_string(),
        ));
    }
    let mut remaining = total;
    let mut sizes = Vec::with_capacity(groups.len());
    for (i, group) in groups.iter().enumerate() {
        let pct = group.target_percentage;
        if !(pct > 0.0 && pct <= 100.0) {
            return Err(RolloutError::InvalidDefinition(format!(
                "group {i}: target_percentage {pct} outside (0, 100]"
            )));
        }
        let size = if i + 1 == groups.len() {
            remaining
        } else {
            ((pct * remaining as f64 / 100.0).ceil() as usize).min(remaining)
        };
        remaining -= size;
        sizes.push(size);
    }
    Ok(sizes)
}
