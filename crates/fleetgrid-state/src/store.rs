//! StateStore — redb-backed state persistence for FleetGrid.
//!
//! Provides typed access to targets, distribution sets, actions, the action
//! status log, rollouts and rollout groups. Single-record helpers open their
//! own transaction; anything that must change several records atomically
//! goes through [`StateStore::write`] and the [`WriteTxn`] handle.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Fetch and decode one JSON value, yielding `Option<T>`.
macro_rules! get_json {
    ($table:expr, $key:expr) => {
        match $table.get($key)? {
            Some(guard) => Some(serde_json::from_slice(guard.value())?),
            None => None,
        }
    };
}

/// Encode a value as JSON bytes.
macro_rules! to_json {
    ($value:expr) => {
        serde_json::to_vec($value)?
    };
}

/// Read accessors shared by read and write transactions.
macro_rules! read_methods {
    () => {
        /// Get a target by tenant and controller id.
        pub fn target(&self, tenant: &str, controller_id: &str) -> StateResult<Option<Target>> {
            let table = self.txn.open_table(TARGETS)?;
            let key = target_key(tenant, controller_id);
            Ok(get_json!(table, key.as_str()))
        }

        /// List all targets of a tenant, ordered by controller id.
        pub fn targets(&self, tenant: &str) -> StateResult<Vec<Target>> {
            let prefix = format!("{tenant}/");
            let table = self.txn.open_table(TARGETS)?;
            let mut results = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (key, value) = entry?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                let target: Target = serde_json::from_slice(value.value())?;
                results.push(target);
            }
            Ok(results)
        }

        /// Get a distribution set, scoped to a tenant.
        pub fn distribution_set(
            &self,
            tenant: &str,
            id: DistributionSetId,
        ) -> StateResult<Option<DistributionSet>> {
            let table = self.txn.open_table(DISTRIBUTION_SETS)?;
            let ds: Option<DistributionSet> = get_json!(table, id);
            Ok(ds.filter(|ds| ds.tenant == tenant))
        }

        /// Get an action by id regardless of tenant.
        pub fn action_by_id(&self, id: ActionId) -> StateResult<Option<Action>> {
            let table = self.txn.open_table(ACTIONS)?;
            Ok(get_json!(table, id))
        }

        /// Get an action, scoped to a tenant.
        pub fn action(&self, tenant: &str, id: ActionId) -> StateResult<Option<Action>> {
            Ok(self.action_by_id(id)?.filter(|a| a.tenant == tenant))
        }

        /// All actions of a target in creation order.
        pub fn actions_for_target(
            &self,
            tenant: &str,
            controller_id: &str,
        ) -> StateResult<Vec<Action>> {
            let key = target_key(tenant, controller_id);
            let ids: Vec<ActionId> = {
                let index = self.txn.open_table(TARGET_ACTIONS)?;
                let mut ids = Vec::new();
                for entry in index.range((key.as_str(), 0u64)..=(key.as_str(), u64::MAX))? {
                    let (k, _) = entry?;
                    ids.push(k.value().1);
                }
                ids
            };
            self.load_actions(&ids)
        }

        /// Status log of an action, oldest first.
        pub fn action_status(&self, action_id: ActionId) -> StateResult<Vec<ActionStatus>> {
            let table = self.txn.open_table(ACTION_STATUS)?;
            let mut results = Vec::new();
            for entry in table.range((action_id, 0u64)..=(action_id, u64::MAX))? {
                let (_, value) = entry?;
                let status: ActionStatus = serde_json::from_slice(value.value())?;
                results.push(status);
            }
            Ok(results)
        }

        /// Count status entries of an action, optionally only those from `source`.
        pub fn count_action_status(
            &self,
            action_id: ActionId,
            source: Option<StatusSource>,
        ) -> StateResult<u64> {
            let entries = self.action_status(action_id)?;
            Ok(entries
                .iter()
                .filter(|s| source.is_none_or(|src| s.source == src))
                .count() as u64)
        }

        /// Get a rollout, scoped to a tenant.
        pub fn rollout(&self, tenant: &str, id: RolloutId) -> StateResult<Option<Rollout>> {
            Ok(self.rollout_by_id(id)?.filter(|r| r.tenant == tenant))
        }

        /// Get a rollout by id regardless of tenant.
        pub fn rollout_by_id(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
            let table = self.txn.open_table(ROLLOUTS)?;
            Ok(get_json!(table, id))
        }

        /// List rollouts, optionally restricted to one tenant.
        pub fn rollouts(&self, tenant: Option<&str>) -> StateResult<Vec<Rollout>> {
            let table = self.txn.open_table(ROLLOUTS)?;
            let mut results = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let rollout: Rollout = serde_json::from_slice(value.value())?;
                if tenant.is_none_or(|t| rollout.tenant == t) {
                    results.push(rollout);
                }
            }
            Ok(results)
        }

        /// Get a rollout group by id.
        pub fn group(&self, id: GroupId) -> StateResult<Option<RolloutGroup>> {
            let table = self.txn.open_table(ROLLOUT_GROUPS)?;
            Ok(get_json!(table, id))
        }

        /// Groups of a rollout in position order.
        pub fn groups_of(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
            let ids: Vec<GroupId> = {
                let index = self.txn.open_table(ROLLOUT_GROUP_INDEX)?;
                let mut ids = Vec::new();
                for entry in index.range((rollout_id, 0u32)..=(rollout_id, u32::MAX))? {
                    let (_, value) = entry?;
                    ids.push(value.value());
                }
                ids
            };
            let table = self.txn.open_table(ROLLOUT_GROUPS)?;
            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                let group: Option<RolloutGroup> = get_json!(table, id);
                results.extend(group);
            }
            Ok(results)
        }

        /// Controller ids assigned to a group at rollout creation.
        pub fn group_targets(&self, group_id: GroupId) -> StateResult<Vec<String>> {
            let table = self.txn.open_table(GROUP_TARGETS)?;
            let mut results = Vec::new();
            for entry in table.range((group_id, 0u64)..=(group_id, u64::MAX))? {
                let (_, value) = entry?;
                results.push(value.value().to_string());
            }
            Ok(results)
        }

        /// Actions materialized for a group, in creation order.
        pub fn actions_of(&self, group_id: GroupId) -> StateResult<Vec<Action>> {
            let ids: Vec<ActionId> = {
                let index = self.txn.open_table(GROUP_ACTIONS)?;
                let mut ids = Vec::new();
                for entry in index.range((group_id, 0u64)..=(group_id, u64::MAX))? {
                    let (k, _) = entry?;
                    ids.push(k.value().1);
                }
                ids
            };
            self.load_actions(&ids)
        }

        /// The deployment covering each group member, in member order.
        ///
        /// A member without an action of the group is covered by its latest
        /// deployment of `distribution_set`, if any. That is the case for
        /// targets skipped at group start because the set was already
        /// assigned to them.
        pub fn group_member_actions(
            &self,
            tenant: &str,
            group_id: GroupId,
            distribution_set: DistributionSetId,
        ) -> StateResult<Vec<Option<Action>>> {
            let mut own: HashMap<String, Action> = self
                .actions_of(group_id)?
                .into_iter()
                .filter(|a| !a.is_cancel())
                .map(|a| (a.controller_id.clone(), a))
                .collect();
            let mut members = Vec::new();
            for controller_id in self.group_targets(group_id)? {
                if let Some(action) = own.remove(&controller_id) {
                    members.push(Some(action));
                    continue;
                }
                let existing = self
                    .actions_for_target(tenant, &controller_id)?
                    .into_iter()
                    .filter(|a| {
                        a.deployment()
                            .is_some_and(|d| d.distribution_set == distribution_set)
                    })
                    .max_by_key(|a| a.id);
                members.push(existing);
            }
            Ok(members)
        }

        fn load_actions(&self, ids: &[ActionId]) -> StateResult<Vec<Action>> {
            let table = self.txn.open_table(ACTIONS)?;
            let mut results = Vec::with_capacity(ids.len());
            for id in ids {
                let action: Option<Action> = get_json!(table, *id);
                match action {
                    Some(action) => results.push(action),
                    None => warn!(action_id = id, "index points at missing action"),
                }
            }
            Ok(results)
        }
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

/// A consistent read-only snapshot.
pub struct ReadTxn {
    txn: redb::ReadTransaction,
}

/// An open write transaction; committed when the closure passed to
/// [`StateStore::write`] returns `Ok`.
pub struct WriteTxn {
    txn: redb::WriteTransaction,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write()?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TARGETS)?;
        txn.open_table(DISTRIBUTION_SETS)?;
        txn.open_table(ACTIONS)?;
        txn.open_table(TARGET_ACTIONS)?;
        txn.open_table(ACTION_STATUS)?;
        txn.open_table(ROLLOUTS)?;
        txn.open_table(ROLLOUT_GROUPS)?;
        txn.open_table(ROLLOUT_GROUP_INDEX)?;
        txn.open_table(GROUP_TARGETS)?;
        txn.open_table(GROUP_ACTIONS)?;
        txn.open_table(SEQUENCES)?;
        txn.commit()?;
        Ok(())
    }

    /// Run `f` against a consistent snapshot.
    pub fn read<T, E>(&self, f: impl FnOnce(&ReadTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_read().map_err(StateError::from)?;
        f(&ReadTxn { txn })
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`, aborts (discarding every write made by
    /// `f`) when it returns `Err`.
    pub fn write<T, E>(&self, f: impl FnOnce(&WriteTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(StateError::from)?;
        let wtxn = WriteTxn { txn };
        match f(&wtxn) {
            Ok(value) => {
                wtxn.txn.commit().map_err(StateError::from)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = wtxn.txn.abort() {
                    warn!(error = %e, "failed to abort write transaction");
                }
                Err(err)
            }
        }
    }

    // ── Single-shot helpers ────────────────────────────────────────

    /// Get a target by tenant and controller id.
    pub fn get_target(&self, tenant: &str, controller_id: &str) -> StateResult<Option<Target>> {
        self.read(|txn| txn.target(tenant, controller_id))
    }

    /// Insert or update a target.
    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        self.write(|txn| txn.put_target(target))
    }

    /// List all targets of a tenant.
    pub fn list_targets(&self, tenant: &str) -> StateResult<Vec<Target>> {
        self.read(|txn| txn.targets(tenant))
    }

    /// Get an action, scoped to a tenant.
    pub fn get_action(&self, tenant: &str, id: ActionId) -> StateResult<Option<Action>> {
        self.read(|txn| txn.action(tenant, id))
    }

    /// All actions of a target in creation order.
    pub fn list_actions_for_target(
        &self,
        tenant: &str,
        controller_id: &str,
    ) -> StateResult<Vec<Action>> {
        self.read(|txn| txn.actions_for_target(tenant, controller_id))
    }

    /// Status log of an action, oldest first.
    pub fn list_action_status(&self, action_id: ActionId) -> StateResult<Vec<ActionStatus>> {
        self.read(|txn| txn.action_status(action_id))
    }

    /// Get a distribution set, scoped to a tenant.
    pub fn get_distribution_set(
        &self,
        tenant: &str,
        id: DistributionSetId,
    ) -> StateResult<Option<DistributionSet>> {
        self.read(|txn| txn.distribution_set(tenant, id))
    }

    /// Store a new distribution set, assigning its id.
    pub fn create_distribution_set(&self, mut ds: DistributionSet) -> StateResult<DistributionSet> {
        self.write(|txn| {
            ds.id = txn.next_id("distribution_set")?;
            txn.put_distribution_set(&ds)?;
            Ok(ds)
        })
    }

    /// Get a rollout, scoped to a tenant.
    pub fn get_rollout(&self, tenant: &str, id: RolloutId) -> StateResult<Option<Rollout>> {
        self.read(|txn| txn.rollout(tenant, id))
    }

    /// List rollouts of one tenant, or of every tenant when `None`.
    pub fn list_rollouts(&self, tenant: Option<&str>) -> StateResult<Vec<Rollout>> {
        self.read(|txn| txn.rollouts(tenant))
    }

    /// Groups of a rollout in position order.
    pub fn list_groups(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        self.read(|txn| txn.groups_of(rollout_id))
    }
}

impl ReadTxn {
    read_methods!();
}

impl WriteTxn {
    read_methods!();

    /// Draw the next id from the named sequence (ids start at 1).
    pub fn next_id(&self, sequence: &str) -> StateResult<u64> {
        let mut table = self.txn.open_table(SEQUENCES)?;
        let current = table
            .get(sequence)?
            .map(|guard| guard.value())
            .unwrap_or(0);
        let next = current + 1;
        table.insert(sequence, next)?;
        Ok(next)
    }

    /// Insert or update a target.
    pub fn put_target(&self, target: &Target) -> StateResult<()> {
        let key = target.table_key();
        let value = to_json!(target);
        let mut table = self.txn.open_table(TARGETS)?;
        table.insert(key.as_str(), value.as_slice())?;
        Ok(())
    }

    /// Register a polling target, or refresh its poll timestamp and address.
    ///
    /// Audit fields (`created_at`, `created_by`) of an existing target are
    /// left untouched. Returns the stored target and whether it was created.
    pub fn create_or_touch_target(
        &self,
        tenant: &str,
        controller_id: &str,
        address: Option<&str>,
        now: DateTime<Utc>,
    ) -> StateResult<(Target, bool)> {
        let (mut target, created) = match self.target(tenant, controller_id)? {
            Some(target) => (target, false),
            None => {
                let mut target = Target::new(tenant, controller_id, "plug-and-play", now);
                target.update_status = TargetUpdateStatus::Registered;
                (target, true)
            }
        };
        if target.update_status == TargetUpdateStatus::Unknown {
            target.update_status = TargetUpdateStatus::Registered;
        }
        target.last_poll_at = Some(now);
        if let Some(address) = address {
            target.address = Some(address.to_string());
        }
        self.put_target(&target)?;
        if created {
            debug!(%tenant, %controller_id, "target registered on first poll");
        }
        Ok((target, created))
    }

    /// Insert or update a distribution set.
    pub fn put_distribution_set(&self, ds: &DistributionSet) -> StateResult<()> {
        let value = to_json!(ds);
        let mut table = self.txn.open_table(DISTRIBUTION_SETS)?;
        table.insert(ds.id, value.as_slice())?;
        Ok(())
    }

    /// Insert or update an action and maintain its index entries.
    pub fn put_action(&self, action: &Action) -> StateResult<()> {
        let value = to_json!(action);
        {
            let mut table = self.txn.open_table(ACTIONS)?;
            table.insert(action.id, value.as_slice())?;
        }
        {
            let key = action.target_key();
            let mut index = self.txn.open_table(TARGET_ACTIONS)?;
            index.insert((key.as_str(), action.id), ())?;
        }
        if let Some(rollout) = action.rollout {
            let mut index = self.txn.open_table(GROUP_ACTIONS)?;
            index.insert((rollout.group_id, action.id), ())?;
        }
        Ok(())
    }

    /// Append an entry to an action's status log, assigning its sequence.
    pub fn append_action_status(&self, mut entry: ActionStatus) -> StateResult<ActionStatus> {
        let mut table = self.txn.open_table(ACTION_STATUS)?;
        let last = {
            let mut range = table.range((entry.action_id, 0u64)..=(entry.action_id, u64::MAX))?;
            match range.next_back() {
                Some(item) => Some(item?.0.value().1),
                None => None,
            }
        };
        entry.seq = last.map_or(0, |seq| seq + 1);
        let value = to_json!(&entry);
        table.insert((entry.action_id, entry.seq), value.as_slice())?;
        Ok(entry)
    }

    /// Insert or update a rollout.
    pub fn put_rollout(&self, rollout: &Rollout) -> StateResult<()> {
        let value = to_json!(rollout);
        let mut table = self.txn.open_table(ROLLOUTS)?;
        table.insert(rollout.id, value.as_slice())?;
        Ok(())
    }

    /// Insert or update a rollout group and its position index.
    pub fn put_group(&self, group: &RolloutGroup) -> StateResult<()> {
        let value = to_json!(group);
        {
            let mut table = self.txn.open_table(ROLLOUT_GROUPS)?;
            table.insert(group.id, value.as_slice())?;
        }
        let mut index = self.txn.open_table(ROLLOUT_GROUP_INDEX)?;
        index.insert((group.rollout_id, group.position), group.id)?;
        Ok(())
    }

    /// Record that `controller_id` belongs to a group.
    pub fn add_group_target(
        &self,
        group_id: GroupId,
        index: u64,
        controller_id: &str,
    ) -> StateResult<()> {
        let mut table = self.txn.open_table(GROUP_TARGETS)?;
        table.insert((group_id, index), controller_id)?;
        Ok(())
    }

    /// Move a rollout to `new` if its current status is one of `expected`.
    ///
    /// Returns `false` (and writes nothing) when the rollout is missing or
    /// in another status.
    pub fn transition_rollout(
        &self,
        id: RolloutId,
        expected: &[RolloutStatus],
        new: RolloutStatus,
    ) -> StateResult<bool> {
        let Some(mut rollout) = self.rollout_by_id(id)? else {
            return Ok(false);
        };
        if !expected.contains(&rollout.status) {
            return Ok(false);
        }
        rollout.status = new;
        self.put_rollout(&rollout)?;
        debug!(rollout_id = id, status = ?new, "rollout status changed");
        Ok(true)
    }

    /// Move a group to `new` if its current status is one of `expected`.
    pub fn transition_group(
        &self,
        id: GroupId,
        expected: &[RolloutGroupStatus],
        new: RolloutGroupStatus,
    ) -> StateResult<bool> {
        let Some(mut group) = self.group(id)? else {
            return Ok(false);
        };
        if !expected.contains(&group.status) {
            return Ok(false);
        }
        group.status = new;
        self.put_group(&group)?;
        debug!(group_id = id, status = ?new, "rollout group status changed");
        Ok(true)
    }

    /// Delete a rollout with its groups and membership records.
    ///
    /// Actions created by the rollout are kept. Returns true if it existed.
    pub fn delete_rollout(&self, id: RolloutId) -> StateResult<bool> {
        let groups = self.groups_of(id)?;
        let existed = {
            let mut table = self.txn.open_table(ROLLOUTS)?;
            table.remove(id)?.is_some()
        };

        let mut group_table = self.txn.open_table(ROLLOUT_GROUPS)?;
        let mut group_index = self.txn.open_table(ROLLOUT_GROUP_INDEX)?;
        let mut members = self.txn.open_table(GROUP_TARGETS)?;
        let mut group_actions = self.txn.open_table(GROUP_ACTIONS)?;

        for group in &groups {
            group_table.remove(group.id)?;
            group_index.remove((id, group.position))?;

            let member_keys: Vec<(u64, u64)> = {
                let mut keys = Vec::new();
                for entry in members.range((group.id, 0u64)..=(group.id, u64::MAX))? {
                    keys.push(entry?.0.value());
                }
                keys
            };
            for key in member_keys {
                members.remove(key)?;
            }

            let action_keys: Vec<(u64, u64)> = {
                let mut keys = Vec::new();
                for entry in group_actions.range((group.id, 0u64)..=(group.id, u64::MAX))? {
                    keys.push(entry?.0.value());
                }
                keys
            };
            for key in action_keys {
                group_actions.remove(key)?;
            }
        }

        debug!(rollout_id = id, existed, groups = groups.len(), "rollout deleted");
        Ok(existed)
    }
}
