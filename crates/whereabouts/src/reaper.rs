//! Periodic expiry of clients that stopped heartbeating.
//!
//! A client that goes away silently (closed tab, lost connection) simply
//! stops calling `present`. The reaper turns that silence into leaves: on
//! every tick it asks the store for channels whose earliest deadline has
//! passed and sweeps exactly those, so a tick costs time proportional to the
//! channels with near-term expirations, not to all channels.

use crate::channel::Presence;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A periodic sweep over channels with expiring clients.
pub struct Reaper {
    presence: Presence,
    every: Duration,
}

impl Reaper {
    /// Creates a reaper that sweeps on the given interval.
    pub fn new(presence: Presence, every: Duration) -> Self {
        Self { presence, every }
    }

    /// Starts the background sweep task.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(error) = self.presence.auto_leave_all().await {
                            tracing::warn!(%error, "presence reaper sweep failed");
                        }
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("presence reaper stopped");
        });
        ReaperHandle { shutdown, task }
    }
}

/// Stops a running [`Reaper`].
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signals the reaper to stop and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
