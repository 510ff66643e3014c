//! Presence store: time-stamped liveness records per user.
//!
//! An absent record means offline. Records carry a TTL far above the offline
//! threshold so they self-expire even if the scanner is down; the heartbeat
//! engine owns the actual online/offline classification.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use memory::MemoryPresence;
pub use redis::RedisPresence;

pub type PresenceResult<T> = Result<T, PresenceError>;

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence backend unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Presence records self-expire after this long regardless of the scanner.
pub const PRESENCE_TTL: Duration = Duration::from_secs(72 * 60 * 60);

/// Storage key for a user's liveness record.
pub(crate) fn presence_key(user_id: i64) -> String {
    format!("user:online:{user_id}")
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set(
        &self,
        user_id: i64,
        timestamp: DateTime<Utc>,
        ttl: Duration,
    ) -> PresenceResult<()>;

    async fn get(&self, user_id: i64) -> PresenceResult<Option<DateTime<Utc>>>;

    async fn delete(&self, user_id: i64) -> PresenceResult<()>;

    /// All live records. Feeds the offline scanner.
    async fn scan(&self) -> PresenceResult<Vec<(i64, DateTime<Utc>)>>;
}
