//! Redis-backed presence store.
//!
//! One key per user (`user:online:<uid>`) holding the last-active instant as
//! unix milliseconds, written with SETEX so records expire on their own.
use super::{PresenceError, PresenceResult, PresenceStore, presence_key};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const KEY_PATTERN: &str = "user:online:*";
const KEY_PREFIX: &str = "user:online:";

pub struct RedisPresence {
    conn: Arc<Mutex<redis::aio::MultiplexedConnection>>,
}

impl RedisPresence {
    pub async fn connect(url: &str) -> PresenceResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| PresenceError::Unavailable(err.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| PresenceError::Unavailable(err.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn decode_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

#[async_trait]
impl PresenceStore for RedisPresence {
    async fn set(
        &self,
        user_id: i64,
        timestamp: DateTime<Utc>,
        ttl: Duration,
    ) -> PresenceResult<()> {
        let mut conn = self.conn.lock().await;
        let _: () = redis::cmd("SETEX")
            .arg(presence_key(user_id))
            .arg(ttl.as_secs().max(1))
            .arg(timestamp.timestamp_millis())
            .query_async(&mut *conn)
            .await
            .context("write presence record")?;
        Ok(())
    }

    async fn get(&self, user_id: i64) -> PresenceResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(presence_key(user_id))
            .query_async(&mut *conn)
            .await
            .context("read presence record")?;
        Ok(value.as_deref().and_then(decode_timestamp))
    }

    async fn delete(&self, user_id: i64) -> PresenceResult<()> {
        let mut conn = self.conn.lock().await;
        let _: () = redis::cmd("DEL")
            .arg(presence_key(user_id))
            .query_async(&mut *conn)
            .await
            .context("delete presence record")?;
        Ok(())
    }

    async fn scan(&self) -> PresenceResult<Vec<(i64, DateTime<Utc>)>> {
        let mut conn = self.conn.lock().await;
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(KEY_PATTERN)
            .query_async(&mut *conn)
            .await
            .context("list presence records")?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(user_id) = key
                .strip_prefix(KEY_PREFIX)
                .and_then(|raw| raw.parse::<i64>().ok())
            else {
                continue;
            };
            // A record can expire between KEYS and GET; skip the gap.
            let value: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut *conn)
                .await
                .context("read presence record")?;
            if let Some(timestamp) = value.as_deref().and_then(decode_timestamp) {
                records.push((user_id, timestamp));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_decode_from_unix_millis() {
        let now = Utc::now();
        let decoded = decode_timestamp(&now.timestamp_millis().to_string()).expect("decode");
        assert_eq!(decoded.timestamp_millis(), now.timestamp_millis());
        assert_eq!(decode_timestamp("not-a-number"), None);
    }
}
