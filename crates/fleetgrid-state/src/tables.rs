//! redb table definitions for the FleetGrid state store.
//!
//! Record tables hold JSON-serialized domain types in `&[u8]` values.
//! Index tables carry no payload (`()`) or a single scalar; their tuple keys
//! make related records reachable by range scan.

use redb::TableDefinition;

/// Targets keyed by `{tenant}/{controller_id}`.
pub const TARGETS: TableDefinition<&str, &[u8]> = TableDefinition::new("targets");

/// Distribution sets keyed by id.
pub const DISTRIBUTION_SETS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("distribution_sets");

/// Actions keyed by id.
pub const ACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("actions");

/// Index: `({tenant}/{controller_id}, action_id)`.
pub const TARGET_ACTIONS: TableDefinition<(&str, u64), ()> =
    TableDefinition::new("target_actions");

/// Status log keyed by `(action_id, sequence)`.
pub const ACTION_STATUS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("action_status");

/// Rollouts keyed by id.
pub const ROLLOUTS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollouts");

/// Rollout groups keyed by id.
pub const ROLLOUT_GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("rollout_groups");

/// Index: `(rollout_id, position)` → group id.
pub const ROLLOUT_GROUP_INDEX: TableDefinition<(u64, u32), u64> =
    TableDefinition::new("rollout_group_index");

/// Group membership: `(group_id, index)` → controller id.
pub const GROUP_TARGETS: TableDefinition<(u64, u64), &str> = TableDefinition::new("group_targets");

/// Index: `(group_id, action_id)`.
pub const GROUP_ACTIONS: TableDefinition<(u64, u64), ()> = TableDefinition::new("group_actions");

/// Id sequences keyed by record kind.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
