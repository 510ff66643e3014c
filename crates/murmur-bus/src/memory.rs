// In-process bus over tokio broadcast channels.
//
// One broadcast channel per user id, created lazily on first subscribe or
// publish. Useful for single-instance deployments and tests; multi-instance
// deployments need the redis backend so channels span processes.
use crate::{Bus, Result, SUBSCRIPTION_QUEUE_DEPTH, Subscription};
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast, mpsc};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryBus {
    // Map of user id -> broadcast sender for that user's channel.
    channels: RwLock<HashMap<i64, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    async fn sender(&self, user_id: i64) -> broadcast::Sender<Bytes> {
        if let Some(sender) = self.channels.read().await.get(&user_id) {
            return sender.clone();
        }
        let mut guard = self.channels.write().await;
        guard
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Bus for MemoryBus {
    async fn subscribe(&self, user_id: i64) -> Result<Subscription> {
        let mut source = self.sender(user_id).await.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        let pump = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Best-effort channel: lagging endpoints lose events
                        // and recover through the receipt ledger.
                        tracing::warn!(user_id, skipped, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx, pump))
    }

    async fn publish(&self, user_id: i64, payload: Bytes) -> Result<usize> {
        let guard = self.channels.read().await;
        let Some(sender) = guard.get(&user_id) else {
            // Nobody ever subscribed: silent drop.
            return Ok(0);
        };
        // send() errors only when there are zero receivers, which is the
        // same silent-drop case.
        Ok(sender.send(payload).unwrap_or(0))
    }
}
