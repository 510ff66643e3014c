//! Heartbeat engine: keepalive classification and the offline scanner.
//!
//! Online/offline is derived, never stored: a user is online iff their last
//! heartbeat is younger than `interval + 2 * delta`. The engine holds no
//! per-user state of its own; everything lives in the presence store, so any
//! instance can classify any user.
//!
//! Transitions fan out as `PRESENCE_CHANGE` events to *interested users*:
//! everyone sharing at least one chat with the subject, filtered to those
//! currently online (the delivery engine's presence gate applies the
//! filter). Transitions are monotone within one engine tick but not totally
//! ordered across instances; receivers treat later timestamps as
//! authoritative.
use crate::delivery::Delivery;
use crate::presence::{PRESENCE_TTL, PresenceStore};
use crate::store::ChatStore;
use chrono::Utc;
use murmur_wire::{Envelope, EventKind, PresenceChange};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Timing knobs for the presence invariant.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatParams {
    /// Expected keepalive cadence.
    pub interval: Duration,
    /// Grace allowance on top of the cadence.
    pub delta: Duration,
    /// Offline scanner sweep cadence.
    pub scan_interval: Duration,
}

impl Default for HeartbeatParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            delta: Duration::from_secs(5),
            scan_interval: Duration::from_secs(15),
        }
    }
}

impl HeartbeatParams {
    /// Gap after which a fresh heartbeat counts as an offline->online edge.
    pub fn refresh_gap(&self) -> Duration {
        self.interval + self.delta
    }

    /// Age past which a user is considered offline.
    pub fn offline_after(&self) -> Duration {
        self.interval + 2 * self.delta
    }
}

pub struct HeartbeatEngine {
    presence: Arc<dyn PresenceStore>,
    store: Arc<dyn ChatStore>,
    delivery: Arc<Delivery>,
    params: HeartbeatParams,
}

impl HeartbeatEngine {
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        store: Arc<dyn ChatStore>,
        delivery: Arc<Delivery>,
        params: HeartbeatParams,
    ) -> Self {
        Self {
            presence,
            store,
            delivery,
            params,
        }
    }

    /// Record a keepalive. Emits a presence-change event when this heartbeat
    /// flips the user from offline to online.
    pub async fn handle_heartbeat(&self, user_id: i64) -> anyhow::Result<()> {
        let now = Utc::now();
        let previous = self.presence.get(user_id).await?;
        let was_offline = match previous {
            None => true,
            Some(last_active) => {
                let age = (now - last_active).to_std().unwrap_or_default();
                age > self.params.refresh_gap()
            }
        };

        self.presence.set(user_id, now, PRESENCE_TTL).await?;

        if was_offline {
            tracing::info!(user_id, "user came online");
            self.notify_presence_change(user_id, true).await;
        }
        Ok(())
    }

    pub async fn is_online(&self, user_id: i64) -> bool {
        self.delivery.is_online(user_id).await
    }

    /// Run the offline scanner until the token is cancelled.
    pub fn spawn_scanner(self: Arc<Self>, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.params.scan_interval);
            // The immediate first tick would sweep before anyone connected.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep().await,
                    _ = shutdown.cancelled() => {
                        tracing::debug!("offline scanner stopped");
                        return;
                    }
                }
            }
        });
    }

    /// One scanner pass: drop records past the offline threshold and notify
    /// interested users.
    pub async fn sweep(&self) {
        let records = match self.presence.scan().await {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, "presence scan failed");
                return;
            }
        };

        let threshold = self.params.offline_after();
        let now = Utc::now();
        for (user_id, last_active) in records {
            let age = (now - last_active).to_std().unwrap_or_default();
            if age <= threshold {
                continue;
            }
            if let Err(err) = self.presence.delete(user_id).await {
                tracing::error!(user_id, error = %err, "failed to delete presence record");
                continue;
            }
            tracing::info!(user_id, "user went offline");
            self.notify_presence_change(user_id, false).await;
        }
    }

    async fn notify_presence_change(&self, user_id: i64, presence: bool) {
        let peers = match self.store.chat_peers(user_id).await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::error!(user_id, error = %err, "failed to load interested users");
                return;
            }
        };

        let event = PresenceChange {
            user_id,
            presence,
            timestamp: Utc::now(),
        };
        let envelope = match Envelope::new(EventKind::PresenceChange, &event) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(user_id, error = %err, "failed to encode presence change");
                return;
            }
        };

        // The delivery gate keeps the fan-out bounded to online peers.
        for peer in peers {
            self.delivery.deliver(peer, &envelope).await;
        }
    }
}
