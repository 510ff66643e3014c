// Per-user fan-out bus.
//
// Every user has one logical channel, `message:<user_id>`. Each live endpoint
// of that user holds its own subscription; publishing is best-effort to the
// endpoints subscribed right now, in publish order per channel. Nothing is
// persisted here: a publish to a user with zero subscribers is silently
// dropped, and durable catch-up is the receipt ledger's job.
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod memory;
pub mod redis;

pub use memory::MemoryBus;
pub use redis::RedisBus;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("bus backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Queue depth between the backend pump and the consuming endpoint.
pub(crate) const SUBSCRIPTION_QUEUE_DEPTH: usize = 256;

/// Channel name for a user's bus channel.
pub fn channel(user_id: i64) -> String {
    format!("message:{user_id}")
}

#[async_trait::async_trait]
pub trait Bus: Send + Sync {
    /// Open a live subscription to `user_id`'s channel.
    async fn subscribe(&self, user_id: i64) -> Result<Subscription>;

    /// Publish one payload to `user_id`'s channel, returning the number of
    /// subscribers it reached.
    async fn publish(&self, user_id: i64, payload: Bytes) -> Result<usize>;
}

/// A live subscription to one user's channel.
///
/// Each backend feeds payloads through a pump task into an mpsc queue; the
/// pump dies with the subscription, which is what releases the backend-side
/// resources (broadcast receiver or redis pubsub connection).
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
    pump: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>, pump: JoinHandle<()>) -> Self {
        Self { rx, pump }
    }

    /// Next payload, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Tear down the subscription and wait for the pump to exit, so a
    /// following publish observes the decremented subscriber count.
    pub async fn close(mut self) {
        self.pump.abort();
        let _ = (&mut self.pump).await;
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
