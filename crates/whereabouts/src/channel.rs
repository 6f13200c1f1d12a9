//! Presence channels: the caller-facing API.
//!
//! A [`Presence`] handle wires together the coordination store, the pub/sub
//! transport, the configuration registry and a clock. [`Presence::channel`]
//! yields a [`PresenceChannel`] scoped to one channel name, on which client
//! transports call [`present`](PresenceChannel::present) as a heartbeat while
//! a client is visible and [`leave`](PresenceChannel::leave) when it goes
//! away; absent heartbeats are resolved by the reaper.
//!
//! # Ordering protocol
//!
//! A state transition and its outbound announcement are two steps over two
//! transports. Event-worthy transitions therefore acquire the channel's
//! publish lease inside the store script (see the store module), publish,
//! then release. While some writer holds the lease, every other event-worthy
//! transition (and every read) backs off and retries with jitter, so
//! subscribers observe announcements in exactly the order the store applied
//! the mutations. Heartbeat refreshes never touch the lease and proceed at
//! full throughput.
//!
//! # Example
//!
//! ```ignore
//! use whereabouts::prelude::*;
//! use std::sync::Arc;
//!
//! let resolver = Arc::new(
//!     PrefixResolver::new().route("/topic-reply", ChannelConfig::public()),
//! );
//! let presence = Presence::new(resolver);
//!
//! let channel = presence.channel("/topic-reply/42");
//! channel.present(1, "tab-a").await?;
//! assert_eq!(channel.count().await?, 1);
//! channel.leave(1, "tab-a").await?;
//! ```

use crate::clock::{Clock, SystemClock};
use crate::config::{
    CONFIG_CACHE_TTL_SECS, CachedResolver, ChannelConfig, ConfigResolver, GroupDirectory, NoGroups,
    can_enter,
};
use crate::error::PresenceError;
use crate::publish::{ChannelUpdate, LocalHub, Publisher, Routing};
use crate::store::{
    LEASE_TTL_SECS, Lease, LeaveOutcome, MemoryStore, PresenceStore, PresentOutcome, StoreError,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A store operation produced by a [`PresenceChannel::retry_locked`] closure.
///
/// Boxed and `Send`-bounded so the retry loop stays free of higher-ranked
/// async-closure lifetimes and the whole future can cross `tokio::spawn`
/// (the reaper drives it from a spawned task).
type StoreOp<T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send>>;

/// How many times an operation retries a contended publish lease before
/// giving up.
const MAX_LOCK_ATTEMPTS: u32 = 10;

/// Base delay between lease retries, in milliseconds.
const LOCK_RETRY_BASE_MS: u64 = 10;

/// Additional random delay between lease retries, in milliseconds.
const LOCK_RETRY_JITTER_MS: u64 = 15;

/// A channel's externally visible presence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// The most recent sequence id the transport assigned on this channel.
    /// A subscriber holding this value can tell from the id stream whether
    /// it missed an update and should refetch.
    pub last_sequence_id: u64,
    /// Present users, ascending. `None` on count-only reads.
    pub user_ids: Option<Vec<u64>>,
    /// Number of present users.
    pub count: usize,
}

struct PresenceInner {
    store: Arc<dyn PresenceStore>,
    publisher: Arc<dyn Publisher>,
    configs: CachedResolver,
    groups: Arc<dyn GroupDirectory>,
    clock: Arc<dyn Clock>,
    lease_ttl_secs: u64,
    max_lock_attempts: u32,
}

/// The presence service: a cheap-clone handle over the store, transport and
/// registry seams.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<PresenceInner>,
}

impl Presence {
    /// Creates a service with in-process defaults: [`MemoryStore`],
    /// [`LocalHub`], no groups, the system clock.
    pub fn new(resolver: Arc<dyn ConfigResolver>) -> Self {
        Self::builder(resolver).build()
    }

    /// Starts configuring a service around the given config resolver.
    pub fn builder(resolver: Arc<dyn ConfigResolver>) -> PresenceBuilder {
        PresenceBuilder {
            resolver,
            store: None,
            publisher: None,
            groups: None,
            clock: None,
            lease_ttl_secs: LEASE_TTL_SECS,
            max_lock_attempts: MAX_LOCK_ATTEMPTS,
            config_cache_ttl_secs: CONFIG_CACHE_TTL_SECS,
        }
    }

    /// Returns the channel handle for `name`.
    pub fn channel(&self, name: impl Into<String>) -> PresenceChannel {
        PresenceChannel {
            name: name.into(),
            presence: self.clone(),
        }
    }

    /// Sweeps every channel with expired clients, announcing the resulting
    /// leaves. Intended to be driven periodically by the reaper.
    ///
    /// Per-channel failures are logged and do not stop the sweep.
    pub async fn auto_leave_all(&self) -> Result<(), PresenceError> {
        let now = self.inner.clock.unix_now();
        let due = self.inner.store.due_channels(now).await?;
        for name in due {
            if let Err(error) = self.channel(name.as_str()).auto_leave().await {
                tracing::warn!(channel = %name, %error, "auto-leave failed for channel");
            }
        }
        Ok(())
    }

    /// Deletes all presence state for every channel. Debug/test only.
    pub async fn clear_all(&self) -> Result<(), PresenceError> {
        self.inner.store.clear_all().await?;
        Ok(())
    }
}

/// Configures a [`Presence`] service.
pub struct PresenceBuilder {
    resolver: Arc<dyn ConfigResolver>,
    store: Option<Arc<dyn PresenceStore>>,
    publisher: Option<Arc<dyn Publisher>>,
    groups: Option<Arc<dyn GroupDirectory>>,
    clock: Option<Arc<dyn Clock>>,
    lease_ttl_secs: u64,
    max_lock_attempts: u32,
    config_cache_ttl_secs: u64,
}

impl PresenceBuilder {
    /// Uses the given coordination store.
    pub fn store(mut self, store: Arc<dyn PresenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Uses the given pub/sub transport.
    pub fn publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Uses the given group directory.
    pub fn groups(mut self, groups: Arc<dyn GroupDirectory>) -> Self {
        self.groups = Some(groups);
        self
    }

    /// Uses the given time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Overrides the publish-lease TTL.
    pub fn lease_ttl(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    /// Overrides the lease retry budget.
    pub fn max_lock_attempts(mut self, attempts: u32) -> Self {
        self.max_lock_attempts = attempts;
        self
    }

    /// Overrides how long resolved channel configs are cached.
    pub fn config_cache_ttl(mut self, secs: u64) -> Self {
        self.config_cache_ttl_secs = secs;
        self
    }

    /// Builds the service handle.
    pub fn build(self) -> Presence {
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        Presence {
            inner: Arc::new(PresenceInner {
                store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
                publisher: self.publisher.unwrap_or_else(|| Arc::new(LocalHub::new())),
                configs: CachedResolver::new(
                    self.resolver,
                    self.config_cache_ttl_secs,
                    clock.clone(),
                ),
                groups: self.groups.unwrap_or_else(|| Arc::new(NoGroups)),
                clock,
                lease_ttl_secs: self.lease_ttl_secs,
                max_lock_attempts: self.max_lock_attempts,
            }),
        }
    }
}

/// Presence operations scoped to one channel.
pub struct PresenceChannel {
    name: String,
    presence: Presence,
}

impl PresenceChannel {
    /// The channel's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records a heartbeat for `(user_id, client_id)`.
    ///
    /// The first live session for a user announces an enter to subscribers;
    /// repeated calls before the configured timeout merely push the client's
    /// deadline forward and are never announced.
    pub async fn present(&self, user_id: u64, client_id: &str) -> Result<(), PresenceError> {
        let config = self.config().await?;
        self.check_enter(&config, user_id).await?;

        let timeout = config.timeout;
        let store = self.presence.inner.store.clone();
        let name = self.name.clone();
        let client_id = client_id.to_string();
        let (outcome, token) = self
            .retry_locked(move |lease: Lease, now: u64| {
                let store = store.clone();
                let name = name.clone();
                let client_id = client_id.clone();
                Box::pin(async move {
                    let token = lease.token.clone();
                    let outcome = store
                        .present(&name, user_id, &client_id, now + timeout, now, &lease)
                        .await?;
                    Ok((outcome, token))
                })
            })
            .await?;

        match outcome {
            PresentOutcome::Entered => {
                tracing::debug!(channel = %self.name, user_id, "user entered");
                let update = if config.count_only {
                    ChannelUpdate::count_delta(1)
                } else {
                    ChannelUpdate::enter(user_id)
                };
                self.publish_and_release(update, Routing::for_config(&config), &token)
                    .await;
            }
            PresentOutcome::AddedSession | PresentOutcome::Refreshed => {
                tracing::trace!(channel = %self.name, user_id, ?outcome, "presence heartbeat");
            }
        }
        Ok(())
    }

    /// Removes the `(user_id, client_id)` session if it exists.
    ///
    /// Ending a user's last session announces a leave to subscribers.
    pub async fn leave(&self, user_id: u64, client_id: &str) -> Result<(), PresenceError> {
        let config = self.config().await?;
        self.check_enter(&config, user_id).await?;

        let store = self.presence.inner.store.clone();
        let name = self.name.clone();
        let client_id = client_id.to_string();
        let (outcome, token) = self
            .retry_locked(move |lease: Lease, now: u64| {
                let store = store.clone();
                let name = name.clone();
                let client_id = client_id.clone();
                Box::pin(async move {
                    let token = lease.token.clone();
                    let outcome = store.leave(&name, user_id, &client_id, now, &lease).await?;
                    Ok((outcome, token))
                })
            })
            .await?;

        match outcome {
            LeaveOutcome::Left => {
                tracing::debug!(channel = %self.name, user_id, "user left");
                let update = if config.count_only {
                    ChannelUpdate::count_delta(-1)
                } else {
                    ChannelUpdate::leave(user_id)
                };
                self.publish_and_release(update, Routing::for_config(&config), &token)
                    .await;
            }
            LeaveOutcome::RemovedSession | LeaveOutcome::NotPresent => {
                tracing::trace!(channel = %self.name, user_id, ?outcome, "session removed");
            }
        }
        Ok(())
    }

    /// The channel's current state, shaped by its policy: count-only
    /// channels never materialize user ids.
    pub async fn state(&self) -> Result<ChannelState, PresenceError> {
        let config = self.config().await?;
        self.snapshot(config.count_only).await
    }

    /// Present users, ascending; `None` when the channel is count-only.
    pub async fn user_ids(&self) -> Result<Option<Vec<u64>>, PresenceError> {
        Ok(self.state().await?.user_ids)
    }

    /// Number of present users.
    pub async fn count(&self) -> Result<usize, PresenceError> {
        self.config().await?;
        Ok(self.snapshot(true).await?.count)
    }

    /// Expires every overdue client on this channel, announcing the leaves
    /// of users whose last session lapsed. Driven by the reaper.
    pub async fn auto_leave(&self) -> Result<(), PresenceError> {
        let config = self.config().await?;

        let store = self.presence.inner.store.clone();
        let name = self.name.clone();
        let (outcome, token) = self
            .retry_locked(move |lease: Lease, now: u64| {
                let store = store.clone();
                let name = name.clone();
                Box::pin(async move {
                    let token = lease.token.clone();
                    Ok((store.sweep(&name, now, &lease).await?, token))
                })
            })
            .await?;

        if outcome.pruned > 0 {
            tracing::debug!(
                channel = %self.name,
                pruned = outcome.pruned,
                left = outcome.left_user_ids.len(),
                "expired presence clients"
            );
        }
        if !outcome.left_user_ids.is_empty() {
            let update = if config.count_only {
                ChannelUpdate::count_delta(-(outcome.left_user_ids.len() as i64))
            } else {
                ChannelUpdate::leave_many(outcome.left_user_ids)
            };
            self.publish_and_release(update, Routing::for_config(&config), &token)
                .await;
        }
        Ok(())
    }

    /// Deletes all state for this channel. Debug/test only; requires no
    /// config and performs no access checks.
    pub async fn clear(&self) -> Result<(), PresenceError> {
        self.presence.inner.store.clear(&self.name).await?;
        Ok(())
    }

    /// Resolves and validates this channel's policy, failing closed when the
    /// registry does not know the channel.
    async fn config(&self) -> Result<ChannelConfig, PresenceError> {
        let Some(config) = self.presence.inner.configs.resolve(&self.name).await else {
            return Err(PresenceError::NotFound(self.name.clone()));
        };
        if let Err(reason) = config.validate() {
            return Err(PresenceError::InvalidConfig {
                channel: self.name.clone(),
                reason,
            });
        }
        Ok(config)
    }

    /// Rejects callers the policy does not admit, before any state changes.
    async fn check_enter(
        &self,
        config: &ChannelConfig,
        user_id: u64,
    ) -> Result<(), PresenceError> {
        let needs_groups = !config.public
            && config
                .allowed_group_ids
                .as_ref()
                .is_some_and(|groups| !groups.is_empty())
            && !config
                .allowed_user_ids
                .as_ref()
                .is_some_and(|users| users.contains(&user_id));
        let group_ids = if needs_groups {
            self.presence.inner.groups.group_ids(user_id).await
        } else {
            Vec::new()
        };

        if !can_enter(config, Some(user_id), &group_ids) {
            return Err(PresenceError::InvalidAccess {
                channel: self.name.clone(),
                user_id,
            });
        }
        Ok(())
    }

    /// Reads the channel, reporting the transport's sequence pointer.
    ///
    /// The pointer is read before the store snapshot: a transition landing
    /// between the two reads is already visible in the snapshot, so the
    /// subscriber replays its announcement as a no-op instead of missing it.
    async fn snapshot(&self, count_only: bool) -> Result<ChannelState, PresenceError> {
        let inner = &self.presence.inner;
        let last_sequence_id = inner.publisher.last_sequence_id(&self.name).await;
        let store = inner.store.clone();
        let name = self.name.clone();
        let snap = self
            .retry_locked(move |_lease: Lease, now: u64| {
                let store = store.clone();
                let name = name.clone();
                Box::pin(async move { store.read(&name, now, !count_only).await })
            })
            .await?;
        Ok(ChannelState {
            last_sequence_id,
            user_ids: snap.user_ids,
            count: snap.count,
        })
    }

    /// Runs one store script under the lease retry policy: a fresh token per
    /// attempt, bounded attempts, jittered backoff on contention.
    async fn retry_locked<T, F>(&self, mut attempt: F) -> Result<T, PresenceError>
    where
        F: FnMut(Lease, u64) -> StoreOp<T>,
    {
        let inner = &self.presence.inner;
        let mut attempts = 0u32;
        loop {
            let now = inner.clock.unix_now();
            let lease = Lease::generate(inner.lease_ttl_secs);
            match attempt(lease, now).await {
                Ok(value) => return Ok(value),
                Err(StoreError::MutexLocked) => {
                    attempts += 1;
                    if attempts >= inner.max_lock_attempts {
                        tracing::warn!(
                            channel = %self.name,
                            attempts,
                            "gave up waiting for the presence mutex"
                        );
                        return Err(PresenceError::LockContended(self.name.clone()));
                    }
                    let delay = {
                        let mut rng = rand::thread_rng();
                        LOCK_RETRY_BASE_MS + rng.gen_range(0..=LOCK_RETRY_JITTER_MS)
                    };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Publishes an update and releases the lease, in that order.
    ///
    /// A publish failure is logged and the release still runs: the mutation
    /// is already durable, subscribers recover through a state refetch, and
    /// holding the lease any longer would stall the channel for nothing.
    async fn publish_and_release(&self, update: ChannelUpdate, routing: Routing, token: &str) {
        let inner = &self.presence.inner;
        match inner.publisher.publish(&self.name, update, routing).await {
            Ok(sequence_id) => {
                tracing::debug!(channel = %self.name, sequence_id, "published presence update");
            }
            Err(error) => {
                tracing::error!(
                    channel = %self.name,
                    %error,
                    "presence update publish failed; state change stands"
                );
            }
        }
        match inner.store.release(&self.name, token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(channel = %self.name, "presence lease lapsed before release");
            }
            Err(error) => {
                tracing::warn!(channel = %self.name, %error, "presence lease release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrefixResolver;

    #[test]
    fn test_channel_handle_keeps_its_name() {
        let resolver = Arc::new(PrefixResolver::new());
        let presence = Presence::new(resolver);
        let channel = presence.channel("/topic-reply/42");
        assert_eq!(channel.name(), "/topic-reply/42");
    }

    #[tokio::test]
    async fn test_unresolved_channel_fails_closed() {
        let resolver = Arc::new(PrefixResolver::new());
        let presence = Presence::new(resolver);
        let channel = presence.channel("/nowhere/1");

        assert!(matches!(
            channel.present(1, "a").await,
            Err(PresenceError::NotFound(_))
        ));
        assert!(matches!(
            channel.state().await,
            Err(PresenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_config_is_a_programmer_error() {
        let resolver = Arc::new(PrefixResolver::new().route(
            "/broken",
            ChannelConfig::public().allowed_users(vec![1]),
        ));
        let presence = Presence::new(resolver);

        assert!(matches!(
            presence.channel("/broken/1").present(1, "a").await,
            Err(PresenceError::InvalidConfig { .. })
        ));
    }
}
