//! In-memory presence store for dev and tests.
//!
//! Expiry is enforced on read: `get` and `scan` treat a record past its TTL
//! as absent, which mirrors redis key expiry closely enough for the
//! heartbeat engine's purposes.
use super::{PresenceResult, PresenceStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
struct Record {
    timestamp: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct MemoryPresence {
    records: Arc<RwLock<HashMap<i64, Record>>>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set(
        &self,
        user_id: i64,
        timestamp: DateTime<Utc>,
        ttl: Duration,
    ) -> PresenceResult<()> {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.records.write().await.insert(
            user_id,
            Record {
                timestamp,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, user_id: i64) -> PresenceResult<Option<DateTime<Utc>>> {
        let records = self.records.read().await;
        Ok(records
            .get(&user_id)
            .filter(|record| record.expires_at > Utc::now())
            .map(|record| record.timestamp))
    }

    async fn delete(&self, user_id: i64) -> PresenceResult<()> {
        self.records.write().await.remove(&user_id);
        Ok(())
    }

    async fn scan(&self) -> PresenceResult<Vec<(i64, DateTime<Utc>)>> {
        let now = Utc::now();
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|(_, record)| record.expires_at > now)
            .map(|(&user_id, record)| (user_id, record.timestamp))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let store = MemoryPresence::new();
        let now = Utc::now();
        store
            .set(1, now, Duration::from_secs(60))
            .await
            .expect("set");
        assert_eq!(store.get(1).await.expect("get"), Some(now));
        store.delete(1).await.expect("delete");
        assert_eq!(store.get(1).await.expect("get"), None);
    }

    #[tokio::test]
    async fn expired_records_read_as_absent() {
        let store = MemoryPresence::new();
        store
            .set(1, Utc::now(), Duration::from_secs(0))
            .await
            .expect("set");
        assert_eq!(store.get(1).await.expect("get"), None);
        assert!(store.scan().await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn scan_returns_all_live_records() {
        let store = MemoryPresence::new();
        let now = Utc::now();
        store.set(1, now, Duration::from_secs(60)).await.expect("set");
        store.set(2, now, Duration::from_secs(60)).await.expect("set");
        let mut seen: Vec<i64> = store
            .scan()
            .await
            .expect("scan")
            .into_iter()
            .map(|(user_id, _)| user_id)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }
}
