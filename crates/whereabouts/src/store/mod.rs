//! The coordination store: shared presence state behind atomic scripts.
//!
//! All presence state lives in a store reachable by every process, and is
//! only ever mutated through the operations of [`PresenceStore`]. Each
//! operation reads and writes the channel's coupled structures (client
//! expiry set, user session counts, global channel index, publish lease) as
//! one atomic unit, so no caller can observe or interleave a half-applied
//! transition.
//!
//! # The publish lease
//!
//! Transitions that cross a user's session count through zero must be
//! announced to subscribers, and the announcement travels over a separate
//! transport. To keep announcements in mutation order, such transitions
//! check a per-channel lease *inside* the same atomic step: when the lease
//! is free they apply the transition and take the lease in one go; when it
//! is held they fail with [`StoreError::MutexLocked`] without touching
//! state, and the caller retries. Refresh traffic never touches the lease.
//!
//! The lease carries a short TTL so a crashed holder cannot wedge the
//! channel, and release is compare-and-delete by token so a holder that
//! outlived its TTL cannot clobber a newer one.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// How long an acquired publish lease lives before the store considers the
/// holder crashed, in seconds.
pub const LEASE_TTL_SECS: u64 = 10;

/// Errors from coordination-store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Another writer holds the channel's publish lease; retry shortly.
    #[error("channel mutex is held by another writer")]
    MutexLocked,

    /// The store could not be reached or answered incoherently. Operations
    /// fail closed; nothing is guessed from local state.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// One heartbeating client session: a user on one tab/device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    /// The user the session belongs to.
    pub user_id: u64,
    /// The client identifier supplied by the transport (one per tab).
    pub client_id: String,
}

/// A per-attempt claim on a channel's publish lease.
#[derive(Debug, Clone)]
pub struct Lease {
    /// Random token identifying this attempt; release compares against it.
    pub token: String,
    /// Seconds before the store reclaims an unreleased lease.
    pub ttl_secs: u64,
}

impl Lease {
    /// Generates a fresh lease claim with a random token.
    pub fn generate(ttl_secs: u64) -> Self {
        Self {
            token: Uuid::new_v4().simple().to_string(),
            ttl_secs,
        }
    }
}

/// What a `present` call did to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The session already existed; its deadline moved forward.
    Refreshed,
    /// A new session for a user who was already present on another client.
    AddedSession,
    /// The user's first live session. The publish lease was acquired and the
    /// caller must publish an enter update, then release.
    Entered,
}

/// What a `leave` call did to the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// No such session; nothing changed.
    NotPresent,
    /// The session was removed but the user remains on another client.
    RemovedSession,
    /// The user's last session ended. The publish lease was acquired and the
    /// caller must publish a leave update, then release.
    Left,
}

/// The result of sweeping a channel for expired sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Users whose last session expired, ascending. When non-empty the
    /// publish lease was acquired and the caller must publish, then release.
    pub left_user_ids: Vec<u64>,
    /// Total expired sessions removed, including ones whose user stayed
    /// present on a fresher client.
    pub pruned: usize,
}

/// A consistent read of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Present users, ascending. `None` when the read was count-only; the
    /// ids are then never materialized.
    pub user_ids: Option<Vec<u64>>,
    /// Number of present users.
    pub count: usize,
}

/// The atomic scripts every presence deployment shares.
///
/// Implementations must apply each method as a single atomic transition over
/// the channel's structures. Methods that report an event-worthy outcome
/// ([`PresentOutcome::Entered`], [`LeaveOutcome::Left`], a non-empty
/// [`SweepOutcome::left_user_ids`]) have acquired the channel lease for the
/// caller's token as part of that same transition.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upserts a client session with the given deadline.
    ///
    /// Fails with [`StoreError::MutexLocked`], mutating nothing, when the
    /// transition would be the user's first session while the lease is held.
    async fn present(
        &self,
        channel: &str,
        user_id: u64,
        client_id: &str,
        expires_at: u64,
        now: u64,
        lease: &Lease,
    ) -> Result<PresentOutcome, StoreError>;

    /// Removes a client session if it exists.
    ///
    /// Fails with [`StoreError::MutexLocked`], mutating nothing, when the
    /// transition would end the user's last session while the lease is held.
    async fn leave(
        &self,
        channel: &str,
        user_id: u64,
        client_id: &str,
        now: u64,
        lease: &Lease,
    ) -> Result<LeaveOutcome, StoreError>;

    /// Removes every session whose deadline has passed, in one batch.
    async fn sweep(&self, channel: &str, now: u64, lease: &Lease)
    -> Result<SweepOutcome, StoreError>;

    /// Reads the channel without observing a half-published transition:
    /// fails with [`StoreError::MutexLocked`] while a live lease is held.
    async fn read(
        &self,
        channel: &str,
        now: u64,
        include_users: bool,
    ) -> Result<ChannelSnapshot, StoreError>;

    /// Channels whose earliest session deadline is at or before `now`.
    ///
    /// Served from the global channel index; cost is proportional to the
    /// answer, not to the total number of channels.
    async fn due_channels(&self, now: u64) -> Result<Vec<String>, StoreError>;

    /// Releases the channel lease if `token` still holds it. Returns whether
    /// anything was released.
    async fn release(&self, channel: &str, token: &str) -> Result<bool, StoreError>;

    /// Unconditionally deletes all state for one channel. Debug/admin only.
    async fn clear(&self, channel: &str) -> Result<(), StoreError>;

    /// Unconditionally deletes all state for every channel. Debug/test only.
    async fn clear_all(&self) -> Result<(), StoreError>;
}
