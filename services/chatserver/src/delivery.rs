//! Presence-gated fan-out to the bus.
//!
//! The single policy decision lives here: an event for an offline user is
//! dropped, because message-bearing events are recovered from the receipt
//! ledger on reconnect and everything else is ephemeral. Publish failures
//! are logged and dropped for the same reason.
use crate::heartbeat::HeartbeatParams;
use crate::presence::PresenceStore;
use bytes::Bytes;
use chrono::Utc;
use murmur_bus::Bus;
use murmur_wire::Envelope;
use std::sync::Arc;

pub struct Delivery {
    bus: Arc<dyn Bus>,
    presence: Arc<dyn PresenceStore>,
    params: HeartbeatParams,
}

impl Delivery {
    pub fn new(
        bus: Arc<dyn Bus>,
        presence: Arc<dyn PresenceStore>,
        params: HeartbeatParams,
    ) -> Self {
        Self {
            bus,
            presence,
            params,
        }
    }

    /// True iff the user heartbeated within `interval + 2 * delta`.
    pub async fn is_online(&self, user_id: i64) -> bool {
        match self.presence.get(user_id).await {
            Ok(Some(last_active)) => {
                let age = (Utc::now() - last_active).to_std().unwrap_or_default();
                age <= self.params.offline_after()
            }
            Ok(None) => false,
            Err(err) => {
                tracing::error!(user_id, error = %err, "presence lookup failed");
                false
            }
        }
    }

    /// Publish `envelope` to the user's channel if they are online;
    /// otherwise drop it.
    pub async fn deliver(&self, to_user_id: i64, envelope: &Envelope) {
        if !self.is_online(to_user_id).await {
            tracing::debug!(to_user_id, kind = ?envelope.kind, "recipient offline, dropping");
            return;
        }

        let payload = match envelope.encode() {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                tracing::error!(to_user_id, error = %err, "failed to encode envelope");
                return;
            }
        };

        match self.bus.publish(to_user_id, payload).await {
            Ok(reached) => {
                tracing::debug!(to_user_id, reached, kind = ?envelope.kind, "event published");
            }
            Err(err) => {
                tracing::error!(to_user_id, error = %err, "bus publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{MemoryPresence, PRESENCE_TTL};
    use murmur_bus::MemoryBus;
    use murmur_wire::{ChatListChange, EventKind};

    fn delivery(bus: Arc<MemoryBus>, presence: Arc<MemoryPresence>) -> Delivery {
        Delivery::new(bus, presence, HeartbeatParams::default())
    }

    #[tokio::test]
    async fn deliver_reaches_an_online_subscriber() {
        let bus = Arc::new(MemoryBus::new());
        let presence = Arc::new(MemoryPresence::new());
        let delivery = delivery(bus.clone(), presence.clone());

        presence
            .set(7, Utc::now(), PRESENCE_TTL)
            .await
            .expect("presence");
        let mut sub = bus.subscribe(7).await.expect("subscribe");

        let envelope =
            Envelope::new(EventKind::InvitedToChat, &ChatListChange { chat_id: 1 })
                .expect("envelope");
        delivery.deliver(7, &envelope).await;

        let payload = sub.recv().await.expect("payload");
        let decoded = Envelope::decode(&payload).expect("decode");
        assert_eq!(decoded.kind, EventKind::InvitedToChat);
    }

    #[tokio::test]
    async fn deliver_drops_for_offline_users() {
        let bus = Arc::new(MemoryBus::new());
        let presence = Arc::new(MemoryPresence::new());
        let delivery = delivery(bus.clone(), presence.clone());

        // Subscribed endpoint, but no presence record: nothing is published.
        let mut sub = bus.subscribe(7).await.expect("subscribe");
        let envelope =
            Envelope::new(EventKind::InvitedToChat, &ChatListChange { chat_id: 1 })
                .expect("envelope");
        delivery.deliver(7, &envelope).await;

        let got = tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await;
        assert!(got.is_err(), "offline delivery should be dropped");
    }

    #[tokio::test]
    async fn stale_heartbeat_counts_as_offline() {
        let bus = Arc::new(MemoryBus::new());
        let presence = Arc::new(MemoryPresence::new());
        let delivery = delivery(bus.clone(), presence.clone());

        let params = HeartbeatParams::default();
        let stale = Utc::now()
            - chrono::Duration::from_std(params.offline_after()).expect("duration")
            - chrono::Duration::seconds(1);
        presence.set(7, stale, PRESENCE_TTL).await.expect("presence");

        assert!(!delivery.is_online(7).await);
    }
}
