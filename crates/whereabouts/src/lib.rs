//! # Whereabouts - distributed presence tracking
//!
//! Whereabouts tells a multi-process application which users are currently
//! "present" in a named context (viewing a topic, typing in a composer) and
//! broadcasts enter/leave updates to subscribers in real time.
//!
//! # Overview
//!
//! - **Channels**: named presence contexts, the unit of isolation. Clients
//!   heartbeat `present(user_id, client_id)` while visible and either
//!   `leave` explicitly or expire when the heartbeats stop.
//! - **Coordination store**: all state lives in a shared store mutated only
//!   through atomic scripts, so any process may operate on any channel.
//! - **Ordered announcements**: transitions that change whether a user is
//!   present are serialized with their outbound broadcast through a
//!   short-TTL per-channel lease, so subscribers see enters and leaves in
//!   mutation order. Heartbeat refreshes stay lock-free.
//! - **Reaper**: a periodic sweep expires silent clients, using a global
//!   channel index to touch only channels with overdue deadlines.
//!
//! # Quick Start
//!
//! ```ignore
//! use whereabouts::prelude::*;
//! use std::{sync::Arc, time::Duration};
//!
//! // The application's access-control registry, keyed by channel prefix.
//! let resolver = Arc::new(
//!     PrefixResolver::new()
//!         .route("/topic-reply", ChannelConfig::public())
//!         .route("/whispers", ChannelConfig::default().allowed_groups(vec![3])),
//! );
//!
//! let presence = Presence::new(resolver);
//! let reaper = Reaper::new(presence.clone(), Duration::from_secs(2)).spawn();
//!
//! let channel = presence.channel("/topic-reply/42");
//! channel.present(1, "tab-a").await?;
//! let state = channel.state().await?;
//! assert_eq!(state.user_ids, Some(vec![1]));
//!
//! reaper.stop().await;
//! ```

#![deny(missing_docs)]

/// Presence channels and the service handle tying the seams together.
pub mod channel;

/// Unix-seconds time sources.
pub mod clock;

/// Channel configuration, access predicates and the resolver seam.
pub mod config;

/// Error types for presence operations.
pub mod error;

/// Update payloads, routing and the pub/sub transport seam.
pub mod publish;

/// Periodic expiry of silent clients.
pub mod reaper;

/// The coordination store seam and its in-process implementation.
pub mod store;

pub use channel::{ChannelState, Presence, PresenceBuilder, PresenceChannel};
pub use error::PresenceError;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```ignore
/// use whereabouts::prelude::*;
/// ```
pub mod prelude {
    pub use crate::channel::{ChannelState, Presence, PresenceBuilder, PresenceChannel};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{
        ChannelConfig, ConfigResolver, EVERYONE_GROUP_ID, GroupDirectory, NoGroups,
        PrefixResolver, can_enter, can_view, channel_prefix,
    };
    pub use crate::error::PresenceError;
    pub use crate::publish::{ChannelUpdate, LocalHub, PresenceEvent, Publisher, Routing};
    pub use crate::reaper::{Reaper, ReaperHandle};
    pub use crate::store::{MemoryStore, PresenceStore, StoreError};
}
