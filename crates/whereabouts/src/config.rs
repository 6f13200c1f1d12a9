//! Channel configuration and access control.
//!
//! Every channel name maps to a [`ChannelConfig`] through a [`ConfigResolver`]
//! owned by the surrounding application. The resolver is the only authority on
//! which channels exist: a `None` answer means the channel cannot exist and
//! every operation on it fails closed.
//!
//! Policies are keyed by channel *prefix*, the text before the second `/` in
//! the channel name, so `"/topic-reply/42"` and `"/topic-reply/99"` share one
//! policy. [`PrefixResolver`] is a ready-made table for tests and small
//! deployments; production registries implement [`ConfigResolver`] directly
//! and are wrapped in a [`CachedResolver`].

use crate::clock::Clock;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Default client timeout when a policy does not set one, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// How long resolved configurations are cached, in seconds.
pub const CONFIG_CACHE_TTL_SECS: u64 = 10;

/// The pseudo-group every user belongs to. A policy whose group allow-list
/// contains this id admits everyone.
pub const EVERYONE_GROUP_ID: u64 = 0;

/// Visibility and lifetime policy for one channel prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Whether anyone, including anonymous users, may view the channel.
    pub public: bool,
    /// Users allowed to view and enter a non-public channel.
    pub allowed_user_ids: Option<Vec<u64>>,
    /// Groups whose members are allowed to view and enter a non-public
    /// channel.
    pub allowed_group_ids: Option<Vec<u64>>,
    /// Whether readers only ever see a user count, never the user ids.
    pub count_only: bool,
    /// Seconds a client stays present without a fresh heartbeat.
    pub timeout: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            public: false,
            allowed_user_ids: None,
            allowed_group_ids: None,
            count_only: false,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ChannelConfig {
    /// A policy visible to everyone.
    pub fn public() -> Self {
        Self {
            public: true,
            ..Self::default()
        }
    }

    /// Restricts the policy to the given users.
    pub fn allowed_users(mut self, user_ids: impl Into<Vec<u64>>) -> Self {
        self.allowed_user_ids = Some(user_ids.into());
        self
    }

    /// Restricts the policy to members of the given groups.
    pub fn allowed_groups(mut self, group_ids: impl Into<Vec<u64>>) -> Self {
        self.allowed_group_ids = Some(group_ids.into());
        self
    }

    /// Hides user ids from readers, exposing only a count.
    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    /// Overrides the client heartbeat timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    /// Rejects policies that cannot be enforced coherently.
    ///
    /// A zero timeout would expire clients the instant they arrive, and a
    /// public policy carrying allow-lists is contradictory: the registry
    /// authored one of the two by mistake.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout == 0 {
            return Err("timeout must be at least one second".into());
        }
        if self.public && (self.allowed_user_ids.is_some() || self.allowed_group_ids.is_some()) {
            return Err("a public channel may not carry allow-lists".into());
        }
        Ok(())
    }
}

/// Returns the policy prefix of a channel name: the text before the second
/// `/`. `None` when the name is not shaped like `/<prefix>/<rest>`.
pub fn channel_prefix(name: &str) -> Option<&str> {
    let rest = name.strip_prefix('/')?;
    let idx = rest.find('/')?;
    if idx == 0 {
        return None;
    }
    Some(&name[..idx + 1])
}

/// Whether a (possibly anonymous) user may view the channel.
pub fn can_view(config: &ChannelConfig, user_id: Option<u64>, group_ids: &[u64]) -> bool {
    if config.public {
        return true;
    }
    if let Some(user_id) = user_id
        && let Some(allowed) = &config.allowed_user_ids
        && allowed.contains(&user_id)
    {
        return true;
    }
    if let Some(allowed) = &config.allowed_group_ids
        && !allowed.is_empty()
    {
        return allowed.contains(&EVERYONE_GROUP_ID)
            || group_ids.iter().any(|id| allowed.contains(id));
    }
    false
}

/// Whether a user may enter the channel. Anonymous callers can never enter.
pub fn can_enter(config: &ChannelConfig, user_id: Option<u64>, group_ids: &[u64]) -> bool {
    user_id.is_some() && can_view(config, user_id, group_ids)
}

/// Maps a channel name to its policy.
///
/// Implemented by the application's access-control registry. Returning `None`
/// means the channel cannot exist.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    /// Resolves the policy for a channel name.
    async fn resolve(&self, channel: &str) -> Option<ChannelConfig>;
}

/// Supplies the group memberships of a user.
///
/// Only consulted when a policy carries a group allow-list.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    /// Returns the ids of the groups the user belongs to.
    async fn group_ids(&self, user_id: u64) -> Vec<u64>;
}

/// A [`GroupDirectory`] for deployments without groups.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGroups;

#[async_trait]
impl GroupDirectory for NoGroups {
    async fn group_ids(&self, _user_id: u64) -> Vec<u64> {
        Vec::new()
    }
}

/// A static prefix-to-policy table.
#[derive(Default)]
pub struct PrefixResolver {
    routes: HashMap<String, ChannelConfig>,
}

impl PrefixResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a policy for a channel prefix, e.g. `"/topic-reply"`.
    pub fn route(mut self, prefix: impl Into<String>, config: ChannelConfig) -> Self {
        self.routes.insert(prefix.into(), config);
        self
    }
}

#[async_trait]
impl ConfigResolver for PrefixResolver {
    async fn resolve(&self, channel: &str) -> Option<ChannelConfig> {
        let prefix = channel_prefix(channel)?;
        self.routes.get(prefix).cloned()
    }
}

struct CacheSlot {
    cached_at: u64,
    config: Option<ChannelConfig>,
}

/// Wraps a [`ConfigResolver`] with a short-lived per-channel cache.
///
/// Negative answers are cached for the same TTL as positive ones, so a
/// nonexistent channel does not hammer the registry either.
pub struct CachedResolver {
    inner: Arc<dyn ConfigResolver>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
    slots: DashMap<String, CacheSlot>,
}

impl CachedResolver {
    /// Creates a cache in front of `inner` with the given TTL.
    pub fn new(inner: Arc<dyn ConfigResolver>, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            clock,
            ttl_secs,
            slots: DashMap::new(),
        }
    }

    /// Resolves through the cache.
    pub async fn resolve(&self, channel: &str) -> Option<ChannelConfig> {
        let now = self.clock.unix_now();
        if let Some(slot) = self.slots.get(channel)
            && now < slot.cached_at + self.ttl_secs
        {
            return slot.config.clone();
        }
        let config = self.inner.resolve(channel).await;
        self.slots.insert(
            channel.to_string(),
            CacheSlot {
                cached_at: now,
                config: config.clone(),
            },
        );
        config
    }

    /// Drops the cached answer for one channel.
    pub fn invalidate(&self, channel: &str) {
        self.slots.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_channel_prefix() {
        assert_eq!(channel_prefix("/topic-reply/42"), Some("/topic-reply"));
        assert_eq!(channel_prefix("/a/b/c"), Some("/a"));
        assert_eq!(channel_prefix("/topic-reply/"), Some("/topic-reply"));
        assert_eq!(channel_prefix("/topic-reply"), None);
        assert_eq!(channel_prefix("topic-reply/42"), None);
        assert_eq!(channel_prefix("//42"), None);
        assert_eq!(channel_prefix(""), None);
    }

    #[test]
    fn test_public_channel_admits_everyone() {
        let config = ChannelConfig::public();
        assert!(can_view(&config, None, &[]));
        assert!(can_view(&config, Some(1), &[]));
        assert!(can_enter(&config, Some(1), &[]));
        // Anonymous users can look but never enter.
        assert!(!can_enter(&config, None, &[]));
    }

    #[test]
    fn test_allowed_user_ids() {
        let config = ChannelConfig::default().allowed_users(vec![7, 8]);
        assert!(can_enter(&config, Some(7), &[]));
        assert!(!can_enter(&config, Some(9), &[]));
        assert!(!can_view(&config, None, &[]));
    }

    #[test]
    fn test_allowed_group_ids() {
        let config = ChannelConfig::default().allowed_groups(vec![42]);
        assert!(can_enter(&config, Some(1), &[42]));
        assert!(can_enter(&config, Some(1), &[3, 42, 99]));
        assert!(!can_enter(&config, Some(1), &[3]));
        assert!(!can_enter(&config, Some(1), &[]));
    }

    #[test]
    fn test_everyone_pseudo_group() {
        let config = ChannelConfig::default().allowed_groups(vec![EVERYONE_GROUP_ID]);
        assert!(can_view(&config, Some(1), &[]));
        assert!(can_view(&config, None, &[]));
        assert!(can_enter(&config, Some(1), &[]));
        assert!(!can_enter(&config, None, &[]));

        // An empty allow-list admits nobody.
        let empty = ChannelConfig::default().allowed_groups(Vec::new());
        assert!(!can_view(&empty, Some(1), &[]));
    }

    #[test]
    fn test_validate() {
        assert!(ChannelConfig::public().validate().is_ok());
        assert!(ChannelConfig::default().validate().is_ok());
        assert!(ChannelConfig::public().with_timeout(0).validate().is_err());
        assert!(
            ChannelConfig::public()
                .allowed_users(vec![1])
                .validate()
                .is_err()
        );
        assert!(
            ChannelConfig::public()
                .allowed_groups(vec![1])
                .validate()
                .is_err()
        );
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConfigResolver for CountingResolver {
        async fn resolve(&self, channel: &str) -> Option<ChannelConfig> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            channel.starts_with("/known/").then(ChannelConfig::public)
        }
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = CachedResolver::new(inner.clone(), CONFIG_CACHE_TTL_SECS, clock.clone());

        assert!(cache.resolve("/known/1").await.is_some());
        assert!(cache.resolve("/known/1").await.is_some());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        clock.advance(CONFIG_CACHE_TTL_SECS);
        assert!(cache.resolve("/known/1").await.is_some());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_holds_negative_answers() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = CachedResolver::new(inner.clone(), CONFIG_CACHE_TTL_SECS, clock);

        assert!(cache.resolve("/unknown/1").await.is_none());
        assert!(cache.resolve("/unknown/1").await.is_none());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_invalidate() {
        let inner = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = CachedResolver::new(inner.clone(), CONFIG_CACHE_TTL_SECS, clock);

        assert!(cache.resolve("/known/1").await.is_some());
        cache.invalidate("/known/1");
        assert!(cache.resolve("/known/1").await.is_some());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
