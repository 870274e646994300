//! Stable failure categories shared across FleetGrid crates.

use serde::Serialize;

/// What a caller should make of a failure.
///
/// Devices and API clients see this instead of the concrete error type so
/// they can tell "retry later" apart from "give up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown target, action, rollout or distribution set.
    NotFound,
    /// The action is already closed.
    Gone,
    /// Unparseable or out-of-range input.
    Malformed,
    /// An abuse limit was hit.
    QuotaExceeded,
    /// The request contradicts the current state.
    Conflict,
    Internal,
}

impl ErrorKind {
    /// Whether repeating the request later can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::QuotaExceeded | ErrorKind::Internal | ErrorKind::Conflict)
    }
}
