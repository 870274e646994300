//! fleetgrid-state — embedded state store for FleetGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for targets, distribution sets, actions and their status log,
//! rollouts and rollout groups.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Targets are keyed by `{tenant}/{controller_id}`; actions, rollouts,
//! groups and distribution sets by numeric ids drawn from a sequence table.
//! Relationships are stored as index tables with tuple keys
//! (`(target_key, action_id)`, `(group_id, action_id)`, ...) so that
//! "actions of a target" or "actions of a group" are range scans and no
//! record embeds a back-pointer.
//!
//! Multi-record changes go through [`StateStore::write`], which runs a
//! closure inside one redb write transaction. redb admits a single writer
//! at a time, so a closure that reads, checks and writes an action is
//! never interleaved with another writer.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ReadTxn, StateStore, WriteTxn};
pub use types::*;
