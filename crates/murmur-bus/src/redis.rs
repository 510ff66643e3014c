// Redis-backed bus for cross-instance fan-out.
//
// Publishes go through a shared multiplexed connection; each subscription
// opens its own pubsub connection (redis requires a dedicated connection in
// subscriber mode) and pumps messages into the subscription queue. Dropping
// the subscription aborts the pump, which closes the pubsub connection.
use crate::{Bus, BusError, Result, SUBSCRIPTION_QUEUE_DEPTH, Subscription, channel};
use anyhow::Context;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

pub struct RedisBus {
    client: redis::Client,
    publisher: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        Ok(Self {
            client,
            publisher: Arc::new(Mutex::new(publisher)),
        })
    }
}

#[async_trait::async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, user_id: i64) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| BusError::Unavailable(err.to_string()))?;
        pubsub
            .subscribe(channel(user_id))
            .await
            .context("subscribe to user channel")?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        let pump = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload = Bytes::copy_from_slice(msg.get_payload_bytes());
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(rx, pump))
    }

    async fn publish(&self, user_id: i64, payload: Bytes) -> Result<usize> {
        let mut conn = self.publisher.lock().await;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel(user_id))
            .arg(payload.as_ref())
            .query_async(&mut *conn)
            .await
            .context("publish to user channel")?;
        Ok(receivers.max(0) as usize)
    }
}
