// Chat server binary.
//
// Startup order matters: observability first so everything after it logs,
// then config, then the storage/bus backends (migrations run inside the
// postgres connect), then the singletons (hub, heartbeat scanner, metrics
// listener), and finally the HTTP listener. Shutdown reverses it: cancel
// the token, drain the server, then run the migration rollback hook if the
// deployment asked for one.
use anyhow::Context;
use chatserver::app::{self, AppState};
use chatserver::config::{BusBackend, Config, StorageBackend};
use chatserver::delivery::Delivery;
use chatserver::heartbeat::HeartbeatEngine;
use chatserver::hub::Hub;
use chatserver::observability;
use chatserver::presence::{MemoryPresence, PresenceStore, RedisPresence};
use chatserver::store::memory::MemoryStore;
use chatserver::store::postgres::{MIGRATOR, PostgresStore};
use chatserver::store::ChatStore;
use murmur_bus::{Bus, MemoryBus, RedisBus};
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = observability::init_observability("murmur-chatserver");

    let config = Config::from_env().context("chat server config")?;
    let shutdown = CancellationToken::new();

    let (store, pg_pool): (Arc<dyn ChatStore>, Option<PgPool>) = match config.storage {
        StorageBackend::Memory => (Arc::new(MemoryStore::new()), None),
        StorageBackend::Postgres => {
            let pg = config
                .postgres
                .as_ref()
                .context("postgres configuration missing")?;
            let store = PostgresStore::connect(pg).await?;
            let pool = store.pool().clone();
            (Arc::new(store), Some(pool))
        }
    };

    let (bus, presence): (Arc<dyn Bus>, Arc<dyn PresenceStore>) = match config.bus {
        BusBackend::Memory => (
            Arc::new(MemoryBus::new()) as Arc<dyn Bus>,
            Arc::new(MemoryPresence::new()) as Arc<dyn PresenceStore>,
        ),
        BusBackend::Redis => {
            let redis = config
                .redis
                .as_ref()
                .context("redis configuration missing")?;
            let url = redis.url();
            (
                Arc::new(RedisBus::connect(&url).await?) as Arc<dyn Bus>,
                Arc::new(RedisPresence::connect(&url).await?) as Arc<dyn PresenceStore>,
            )
        }
    };

    tracing::info!(
        storage = store.backend_name(),
        bus = ?config.bus,
        "chat backends ready"
    );

    let delivery = Arc::new(Delivery::new(
        bus.clone(),
        presence.clone(),
        config.heartbeat,
    ));
    let heartbeat = Arc::new(HeartbeatEngine::new(
        presence,
        store.clone(),
        delivery.clone(),
        config.heartbeat,
    ));
    heartbeat.clone().spawn_scanner(shutdown.clone());

    let hub = Hub::spawn();
    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    let state = AppState::new(
        store,
        bus,
        delivery,
        heartbeat,
        hub,
        config.jwt.secret.clone(),
        shutdown.clone(),
    );
    let router = app::build_router(state);

    tracing::info!(addr = %config.http_bind, "chat server listening");
    let listener = tokio::net::TcpListener::bind(config.http_bind).await?;

    let signal_token = shutdown.clone();
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    // Stops the scanner and cancels every per-connection scope.
    shutdown.cancel();

    if config.migrate_down_on_shutdown {
        if let Some(pool) = pg_pool {
            match MIGRATOR.undo(&pool, 0).await {
                Ok(()) => tracing::info!("migrations rolled back"),
                Err(err) => tracing::warn!(error = %err, "migration rollback failed"),
            }
        }
    }

    tracing::info!("chat server exited");
    Ok(())
}
