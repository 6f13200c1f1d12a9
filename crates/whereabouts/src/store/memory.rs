//! In-process coordination store.
//!
//! Every script runs inside a single critical section over the store, which
//! gives the same guarantee a server-side script gives a networked store:
//! the channel's coupled structures change as one atomic unit or not at all.
//! Suitable for single-node deployments and tests; multi-node deployments
//! implement [`PresenceStore`](super::PresenceStore) against their shared
//! store instead.

use super::{
    ChannelSnapshot, Lease, LeaveOutcome, PresenceStore, PresentOutcome, SessionKey, StoreError,
    SweepOutcome,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A [`PresenceStore`](super::PresenceStore) backed by process memory.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    channels: HashMap<String, ChannelRecord>,
    /// Global channel index: `(earliest_expires_at, channel)` for every
    /// non-empty channel.
    index: BTreeSet<(u64, String)>,
}

#[derive(Default)]
struct ChannelRecord {
    /// Client expiry set: session -> deadline, unix seconds.
    sessions: BTreeMap<SessionKey, u64>,
    /// Live sessions per user; a key is present iff its count is positive.
    user_counts: HashMap<u64, u32>,
    /// Publish lease, when held.
    lease: Option<HeldLease>,
    /// Score this channel currently occupies in the global index.
    index_score: Option<u64>,
}

struct HeldLease {
    token: String,
    expires_at: u64,
}

impl ChannelRecord {
    fn lease_blocks(&self, now: u64) -> bool {
        self.lease.as_ref().is_some_and(|held| held.expires_at > now)
    }

    fn acquire(&mut self, lease: &Lease, now: u64) {
        self.lease = Some(HeldLease {
            token: lease.token.clone(),
            expires_at: now + lease.ttl_secs,
        });
    }
}

/// Syncs the global index with the channel's current earliest deadline.
fn reindex(index: &mut BTreeSet<(u64, String)>, rec: &mut ChannelRecord, channel: &str) {
    if let Some(old) = rec.index_score.take() {
        index.remove(&(old, channel.to_string()));
    }
    if let Some(earliest) = rec.sessions.values().copied().min() {
        index.insert((earliest, channel.to_string()));
        rec.index_score = Some(earliest);
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn present(
        &self,
        channel: &str,
        user_id: u64,
        client_id: &str,
        expires_at: u64,
        now: u64,
        lease: &Lease,
    ) -> Result<PresentOutcome, StoreError> {
        let mut guard = self.inner.write();
        let StoreInner { channels, index } = &mut *guard;
        let rec = channels.entry(channel.to_string()).or_default();

        let key = SessionKey {
            user_id,
            client_id: client_id.to_string(),
        };
        let is_new = !rec.sessions.contains_key(&key);
        let entering = is_new && rec.user_counts.get(&user_id).copied().unwrap_or(0) == 0;

        if entering {
            if rec.lease_blocks(now) {
                return Err(StoreError::MutexLocked);
            }
            rec.acquire(lease, now);
        }

        rec.sessions.insert(key, expires_at);
        if is_new {
            *rec.user_counts.entry(user_id).or_insert(0) += 1;
        }
        reindex(index, rec, channel);

        Ok(if entering {
            PresentOutcome::Entered
        } else if is_new {
            PresentOutcome::AddedSession
        } else {
            PresentOutcome::Refreshed
        })
    }

    async fn leave(
        &self,
        channel: &str,
        user_id: u64,
        client_id: &str,
        now: u64,
        lease: &Lease,
    ) -> Result<LeaveOutcome, StoreError> {
        let mut guard = self.inner.write();
        let StoreInner { channels, index } = &mut *guard;
        let Some(rec) = channels.get_mut(channel) else {
            return Ok(LeaveOutcome::NotPresent);
        };

        let key = SessionKey {
            user_id,
            client_id: client_id.to_string(),
        };
        if !rec.sessions.contains_key(&key) {
            return Ok(LeaveOutcome::NotPresent);
        }

        let leaving = rec.user_counts.get(&user_id).copied().unwrap_or(0) <= 1;
        if leaving {
            if rec.lease_blocks(now) {
                return Err(StoreError::MutexLocked);
            }
            rec.acquire(lease, now);
        }

        rec.sessions.remove(&key);
        if leaving {
            rec.user_counts.remove(&user_id);
        } else if let Some(count) = rec.user_counts.get_mut(&user_id) {
            *count -= 1;
        }
        reindex(index, rec, channel);

        let empty = rec.sessions.is_empty() && !rec.lease_blocks(now);
        if empty {
            channels.remove(channel);
        }

        Ok(if leaving {
            LeaveOutcome::Left
        } else {
            LeaveOutcome::RemovedSession
        })
    }

    async fn sweep(
        &self,
        channel: &str,
        now: u64,
        lease: &Lease,
    ) -> Result<SweepOutcome, StoreError> {
        let mut guard = self.inner.write();
        let StoreInner { channels, index } = &mut *guard;
        let Some(rec) = channels.get_mut(channel) else {
            return Ok(SweepOutcome::default());
        };

        let expired: Vec<SessionKey> = rec
            .sessions
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return Ok(SweepOutcome::default());
        }

        let mut expired_per_user: HashMap<u64, u32> = HashMap::new();
        for key in &expired {
            *expired_per_user.entry(key.user_id).or_insert(0) += 1;
        }
        let mut left_user_ids: Vec<u64> = expired_per_user
            .iter()
            .filter(|&(user_id, expired)| {
                rec.user_counts.get(user_id).copied().unwrap_or(0) <= *expired
            })
            .map(|(user_id, _)| *user_id)
            .collect();
        left_user_ids.sort_unstable();

        if !left_user_ids.is_empty() {
            if rec.lease_blocks(now) {
                return Err(StoreError::MutexLocked);
            }
            rec.acquire(lease, now);
        }

        for key in &expired {
            rec.sessions.remove(key);
        }
        for (user_id, expired) in expired_per_user {
            match rec.user_counts.get_mut(&user_id) {
                Some(count) if *count > expired => *count -= expired,
                _ => {
                    rec.user_counts.remove(&user_id);
                }
            }
        }
        reindex(index, rec, channel);

        let empty = rec.sessions.is_empty() && !rec.lease_blocks(now);
        if empty {
            channels.remove(channel);
        }

        Ok(SweepOutcome {
            left_user_ids,
            pruned: expired.len(),
        })
    }

    async fn read(
        &self,
        channel: &str,
        now: u64,
        include_users: bool,
    ) -> Result<ChannelSnapshot, StoreError> {
        let guard = self.inner.read();
        let Some(rec) = guard.channels.get(channel) else {
            return Ok(ChannelSnapshot {
                user_ids: include_users.then(Vec::new),
                count: 0,
            });
        };
        if rec.lease_blocks(now) {
            return Err(StoreError::MutexLocked);
        }

        let user_ids = include_users.then(|| {
            let mut ids: Vec<u64> = rec.user_counts.keys().copied().collect();
            ids.sort_unstable();
            ids
        });
        Ok(ChannelSnapshot {
            user_ids,
            count: rec.user_counts.len(),
        })
    }

    async fn due_channels(&self, now: u64) -> Result<Vec<String>, StoreError> {
        let guard = self.inner.read();
        Ok(guard
            .index
            .iter()
            .take_while(|(earliest, _)| *earliest <= now)
            .map(|(_, channel)| channel.clone())
            .collect())
    }

    async fn release(&self, channel: &str, token: &str) -> Result<bool, StoreError> {
        let mut guard = self.inner.write();
        let Some(rec) = guard.channels.get_mut(channel) else {
            return Ok(false);
        };
        if !rec.lease.as_ref().is_some_and(|held| held.token == token) {
            return Ok(false);
        }
        rec.lease = None;
        if rec.sessions.is_empty() {
            guard.channels.remove(channel);
        }
        Ok(true)
    }

    async fn clear(&self, channel: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        if let Some(rec) = guard.channels.remove(channel)
            && let Some(score) = rec.index_score
        {
            guard.index.remove(&(score, channel.to_string()));
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        *self.inner.write() = StoreInner::default();
        Ok(())
    }
}
