//! Error types for presence operations.

use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by channel-level presence operations.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The channel's configuration resolves to nothing; the channel cannot
    /// exist and every operation on it fails closed.
    #[error("channel not found: {0}")]
    NotFound(String),

    /// The caller is not permitted to enter or leave the channel.
    #[error("user {user_id} may not enter channel {channel}")]
    InvalidAccess {
        /// The channel that denied access.
        channel: String,
        /// The user that was denied.
        user_id: u64,
    },

    /// The resolver returned a malformed policy. This is a programmer error
    /// in the configuration registry, not a user-facing condition.
    #[error("invalid config for channel {channel}: {reason}")]
    InvalidConfig {
        /// The channel whose policy is malformed.
        channel: String,
        /// What is wrong with the policy.
        reason: String,
    },

    /// The channel's publish mutex stayed contended past the retry budget.
    #[error("channel {0} stayed contended past the retry budget")]
    LockContended(String),

    /// A coordination-store failure other than transient lock contention.
    #[error(transparent)]
    Store(#[from] StoreError),
}
