//! Fan-out of presence updates to subscribers.
//!
//! The crate mutates presence state in the coordination store and then
//! announces event-worthy transitions through a [`Publisher`]. The publisher
//! assigns each channel a monotonically increasing sequence id per update;
//! readers compare the id stream against [`ChannelState::last_sequence_id`]
//! (see the channel module) to detect missed updates and refetch.
//!
//! [`LocalHub`] is the in-process implementation. Deployments that fan out
//! across nodes implement [`Publisher`] against their message bus instead.
//!
//! [`ChannelState::last_sequence_id`]: crate::channel::ChannelState

use crate::config::ChannelConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default buffered updates per channel in a [`LocalHub`].
const HUB_CAPACITY: usize = 256;

/// A user appearing in a presence diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnteringUser {
    /// The user's id.
    pub id: u64,
}

/// One presence update, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelUpdate {
    /// Users entered and/or left the channel.
    Diff {
        /// Users whose first session just began.
        entering_users: Vec<EnteringUser>,
        /// Users whose last session just ended.
        leaving_user_ids: Vec<u64>,
    },
    /// Count-only channels announce how the user count moved, never who.
    CountDelta {
        /// Change to the number of present users.
        count_delta: i64,
    },
}

impl ChannelUpdate {
    /// A single user entering.
    pub fn enter(user_id: u64) -> Self {
        Self::Diff {
            entering_users: vec![EnteringUser { id: user_id }],
            leaving_user_ids: Vec::new(),
        }
    }

    /// A single user leaving.
    pub fn leave(user_id: u64) -> Self {
        Self::leave_many(vec![user_id])
    }

    /// Several users leaving at once (an expiry sweep).
    pub fn leave_many(user_ids: Vec<u64>) -> Self {
        Self::Diff {
            entering_users: Vec::new(),
            leaving_user_ids: user_ids,
        }
    }

    /// A count-only movement.
    pub fn count_delta(count_delta: i64) -> Self {
        Self::CountDelta { count_delta }
    }
}

/// Who a published update may be delivered to, derived from the channel's
/// policy. The transport enforces this; the crate only computes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Routing {
    /// Deliver to every subscriber.
    Broadcast,
    /// Deliver only to the listed users and members of the listed groups.
    Restricted {
        /// Users allowed to receive the update.
        user_ids: Vec<u64>,
        /// Groups whose members are allowed to receive the update.
        group_ids: Vec<u64>,
    },
}

impl Routing {
    /// Derives routing parameters from a channel policy.
    pub fn for_config(config: &ChannelConfig) -> Self {
        if config.public {
            Self::Broadcast
        } else {
            Self::Restricted {
                user_ids: config.allowed_user_ids.clone().unwrap_or_default(),
                group_ids: config.allowed_group_ids.clone().unwrap_or_default(),
            }
        }
    }
}

/// A sequenced update as seen by a [`LocalHub`] subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// The channel the update belongs to.
    pub channel: String,
    /// Position in the channel's update stream, starting at 1.
    pub sequence_id: u64,
    /// The update itself.
    pub update: ChannelUpdate,
    /// Who may receive it.
    pub routing: Routing,
}

/// Errors from the pub/sub transport.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The transport refused or failed to accept the update.
    #[error("pub/sub transport rejected the update: {0}")]
    Transport(String),
}

/// The pub/sub transport seam.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes an update on a channel and returns the sequence id the
    /// transport assigned to it. Ids are per-channel and strictly
    /// increasing.
    async fn publish(
        &self,
        channel: &str,
        update: ChannelUpdate,
        routing: Routing,
    ) -> Result<u64, PublishError>;

    /// The most recent sequence id assigned on a channel, 0 if none.
    async fn last_sequence_id(&self, channel: &str) -> u64;
}

struct HubChannel {
    last_id: u64,
    tx: broadcast::Sender<PresenceEvent>,
}

/// In-process [`Publisher`] fanning updates out over broadcast channels.
pub struct LocalHub {
    channels: DashMap<String, HubChannel>,
    capacity: usize,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    /// Creates a hub with the default per-channel buffer.
    pub fn new() -> Self {
        Self::with_capacity(HUB_CAPACITY)
    }

    /// Creates a hub buffering up to `capacity` updates per channel for
    /// slow subscribers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity,
        }
    }

    /// Subscribes to a channel's update stream.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<PresenceEvent> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| HubChannel {
                last_id: 0,
                tx: broadcast::channel(self.capacity).0,
            })
            .tx
            .subscribe()
    }
}

#[async_trait]
impl Publisher for LocalHub {
    async fn publish(
        &self,
        channel: &str,
        update: ChannelUpdate,
        routing: Routing,
    ) -> Result<u64, PublishError> {
        let mut entry = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| HubChannel {
                last_id: 0,
                tx: broadcast::channel(self.capacity).0,
            });
        entry.last_id += 1;
        let sequence_id = entry.last_id;
        // Nobody listening is fine; the update is still sequenced.
        let _ = entry.tx.send(PresenceEvent {
            channel: channel.to_string(),
            sequence_id,
            update,
            routing,
        });
        Ok(sequence_id)
    }

    async fn last_sequence_id(&self, channel: &str) -> u64 {
        self.channels
            .get(channel)
            .map(|entry| entry.last_id)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_ids_are_per_channel_and_increasing() {
        let hub = LocalHub::new();

        for expected in 1..=3 {
            let id = hub
                .publish("/room/1", ChannelUpdate::enter(expected), Routing::Broadcast)
                .await
                .unwrap();
            assert_eq!(id, expected);
        }
        let id = hub
            .publish("/room/2", ChannelUpdate::enter(1), Routing::Broadcast)
            .await
            .unwrap();
        assert_eq!(id, 1);

        assert_eq!(hub.last_sequence_id("/room/1").await, 3);
        assert_eq!(hub.last_sequence_id("/room/2").await, 1);
        assert_eq!(hub.last_sequence_id("/room/3").await, 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates_in_order() {
        let hub = LocalHub::new();
        let mut rx = hub.subscribe("/room/1");

        hub.publish("/room/1", ChannelUpdate::enter(7), Routing::Broadcast)
            .await
            .unwrap();
        hub.publish("/room/1", ChannelUpdate::leave(7), Routing::Broadcast)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.sequence_id, 1);
        assert_eq!(first.update, ChannelUpdate::enter(7));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.sequence_id, 2);
        assert_eq!(second.update, ChannelUpdate::leave(7));
    }

    #[test]
    fn test_update_wire_shapes() {
        let diff = serde_json::to_value(ChannelUpdate::enter(3)).unwrap();
        assert_eq!(
            diff,
            serde_json::json!({"entering_users": [{"id": 3}], "leaving_user_ids": []})
        );

        let delta = serde_json::to_value(ChannelUpdate::count_delta(-2)).unwrap();
        assert_eq!(delta, serde_json::json!({"count_delta": -2}));
    }
}
