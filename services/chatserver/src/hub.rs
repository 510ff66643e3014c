//! Process-local registry of live websocket endpoints.
//!
//! The map is owned by a single task; handlers talk to it exclusively
//! through register/unregister messages, so mutations are serialized without
//! a lock and snapshots are always consistent. A user may hold any number of
//! concurrent endpoints (multi-device); each one subscribes to the bus on
//! its own.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

const OP_QUEUE_DEPTH: usize = 64;

enum HubOp {
    Register { user_id: i64, endpoint_id: u64 },
    Unregister { user_id: i64, endpoint_id: u64 },
    Snapshot { reply: oneshot::Sender<HubSnapshot> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSnapshot {
    pub users: usize,
    pub endpoints: usize,
}

#[derive(Clone)]
pub struct Hub {
    ops: mpsc::Sender<HubOp>,
    next_endpoint_id: Arc<AtomicU64>,
}

impl Hub {
    /// Start the owner task and return a cloneable handle.
    pub fn spawn() -> Self {
        let (ops, mut rx) = mpsc::channel(OP_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut endpoints: HashMap<i64, HashSet<u64>> = HashMap::new();
            while let Some(op) = rx.recv().await {
                match op {
                    HubOp::Register {
                        user_id,
                        endpoint_id,
                    } => {
                        endpoints.entry(user_id).or_default().insert(endpoint_id);
                        tracing::info!(user_id, endpoint_id, "endpoint connected");
                    }
                    HubOp::Unregister {
                        user_id,
                        endpoint_id,
                    } => {
                        if let Some(set) = endpoints.get_mut(&user_id) {
                            set.remove(&endpoint_id);
                            if set.is_empty() {
                                endpoints.remove(&user_id);
                            }
                        }
                        tracing::info!(user_id, endpoint_id, "endpoint disconnected");
                    }
                    HubOp::Snapshot { reply } => {
                        let snapshot = HubSnapshot {
                            users: endpoints.len(),
                            endpoints: endpoints.values().map(HashSet::len).sum(),
                        };
                        let _ = reply.send(snapshot);
                    }
                }
                let total: usize = endpoints.values().map(HashSet::len).sum();
                metrics::gauge!("chat_connected_endpoints").set(total as f64);
            }
        });
        Self {
            ops,
            next_endpoint_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a new endpoint for `user_id`, returning its endpoint id.
    pub async fn register(&self, user_id: i64) -> u64 {
        let endpoint_id = self.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        if self
            .ops
            .send(HubOp::Register {
                user_id,
                endpoint_id,
            })
            .await
            .is_err()
        {
            tracing::error!(user_id, "hub owner task is gone");
        }
        endpoint_id
    }

    pub async fn unregister(&self, user_id: i64, endpoint_id: u64) {
        if self
            .ops
            .send(HubOp::Unregister {
                user_id,
                endpoint_id,
            })
            .await
            .is_err()
        {
            tracing::error!(user_id, "hub owner task is gone");
        }
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.ops.send(HubOp::Snapshot { reply }).await.ok()?;
        rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_unregister_track_endpoint_counts() {
        let hub = Hub::spawn();
        let first = hub.register(1).await;
        let second = hub.register(1).await;
        assert_ne!(first, second);
        let snapshot = hub.snapshot().await.expect("snapshot");
        assert_eq!(
            snapshot,
            HubSnapshot {
                users: 1,
                endpoints: 2
            }
        );

        hub.unregister(1, first).await;
        let snapshot = hub.snapshot().await.expect("snapshot");
        assert_eq!(
            snapshot,
            HubSnapshot {
                users: 1,
                endpoints: 1
            }
        );

        hub.unregister(1, second).await;
        let snapshot = hub.snapshot().await.expect("snapshot");
        assert_eq!(
            snapshot,
            HubSnapshot {
                users: 0,
                endpoints: 0
            }
        );
    }

    #[tokio::test]
    async fn users_are_counted_once_across_devices() {
        let hub = Hub::spawn();
        hub.register(1).await;
        hub.register(1).await;
        hub.register(2).await;
        let snapshot = hub.snapshot().await.expect("snapshot");
        assert_eq!(
            snapshot,
            HubSnapshot {
                users: 2,
                endpoints: 3
            }
        );
    }

    #[tokio::test]
    async fn duplicate_unregister_is_harmless() {
        let hub = Hub::spawn();
        let id = hub.register(1).await;
        hub.unregister(1, id).await;
        hub.unregister(1, id).await;
        let snapshot = hub.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.endpoints, 0);
    }
}
