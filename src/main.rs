use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod events;
mod models;
mod services;
mod store;
mod utils;
mod websocket;

use crate::config::AppConfig;
use crate::error::OesError;
use crate::events::{Event, EventBus};
use crate::services::ledger::AccountLedger;
use crate::services::matching::{FeeConfig, MatchingEngine};
use crate::store::{ExternalStore, MemoryStore, StoreKey};

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<AccountLedger>,
    pub bus: Arc<EventBus>,
    pub engine: Arc<MatchingEngine>,
    pub external: Option<Arc<ExternalStore>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oes_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    tracing::info!("Starting OES backend v{}", env!("CARGO_PKG_VERSION"));

    // Service graph: the in-process store is the source of truth.
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(Arc::clone(&store)));
    let ledger = Arc::new(AccountLedger::new(Arc::clone(&store)));
    let fees = FeeConfig {
        maker_rate: config.maker_fee_rate,
        taker_rate: config.taker_fee_rate,
    };
    let engine = Arc::new(MatchingEngine::new(
        Arc::clone(&store),
        Arc::clone(&ledger),
        Arc::clone(&bus),
        fees,
    ));
    tracing::info!("Matching engine initialized");

    // External store mirror (graceful degradation when unreachable)
    let external = if config.mirror_enabled() {
        match ExternalStore::connect(&config.store_url()).await {
            Ok(external) => {
                tracing::info!("External store mirror connected at {}", config.store_url());
                Some(Arc::new(external))
            }
            Err(e) => {
                tracing::warn!("External store unreachable, running without mirror: {}", e);
                None
            }
        }
    } else {
        tracing::info!("No external store configured (STORE_HOST empty)");
        None
    };

    // Startup wipe of mirrored keys unless explicitly preserved
    if let Some(external) = &external {
        if config.no_clear_data {
            tracing::info!("OES_NO_CLEAR_DATA=1, keeping mirrored orders from a previous run");
        } else {
            for pattern in ["order:*", "book:*"] {
                match external.clear_pattern(pattern).await {
                    Ok(n) => tracing::info!("Startup wipe removed {} mirrored {} keys", n, pattern),
                    Err(e) => tracing::warn!("Startup wipe of {} failed: {}", pattern, e),
                }
            }
        }
    }

    // Periodic matching tick: recovers dropped wake-ups and crossed books.
    // A store outage halts the tick; everything else is logged and retried.
    let tick_engine = Arc::clone(&engine);
    let tick_ms = config.match_tick_ms;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
        loop {
            interval.tick().await;
            match tick_engine.run_tick() {
                Ok(()) => {}
                Err(OesError::Unavailable(e)) => {
                    tracing::error!("Store unavailable, halting matching tick: {}", e);
                    break;
                }
                Err(e) => tracing::error!("Matching tick failed: {}", e),
            }
        }
    });
    tracing::info!("Matching tick started ({}ms)", config.match_tick_ms);

    // Snapshot broadcaster: full books for every watched symbol.
    let snapshot_engine = Arc::clone(&engine);
    let snapshot_bus = Arc::clone(&bus);
    let snapshot_ms = config.snapshot_ms;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(snapshot_ms.max(1)));
        loop {
            interval.tick().await;
            for symbol in snapshot_bus.watched_symbols() {
                snapshot_engine.publish_book(&symbol);
            }
        }
    });
    tracing::info!("Snapshot broadcaster started ({}ms)", config.snapshot_ms);

    // Latency heartbeat on the system topic.
    let heartbeat_bus = Arc::clone(&bus);
    let latency_ms = config.latency_ms;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(latency_ms.max(1)));
        loop {
            interval.tick().await;
            heartbeat_bus.publish(
                StoreKey::SYSTEM,
                Event::Latency {
                    server_time: chrono::Utc::now().timestamp_millis(),
                },
            );
        }
    });
    tracing::info!("Latency heartbeat started ({}ms)", config.latency_ms);

    // Execution journal: every trade at info level.
    let mut journal_rx = engine.subscribe_trades();
    tokio::spawn(async move {
        loop {
            match journal_rx.recv().await {
                Ok(trade) => {
                    tracing::info!(
                        "Trade executed: {} {} @ {} on {} (buy={}, sell={})",
                        trade.quantity,
                        trade.symbol,
                        trade.price,
                        trade.venue,
                        trade.buy_order_id,
                        trade.sell_order_id
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Execution journal lagged {} trades", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::warn!("Execution journal stopped");
    });

    // Mirror workers: forward envelopes to the external store's channels
    // and keep mirrored order records current.
    if let Some(external) = external.clone() {
        let mut reliable_rx = bus.subscribe_reliable();
        let reliable_ext = Arc::clone(&external);
        tokio::spawn(async move {
            tracing::info!("Reliable-lane mirror worker started");
            loop {
                match reliable_rx.recv().await {
                    Ok(envelope) => {
                        if let Ok(json) = serde_json::to_string(&envelope) {
                            if let Err(e) = reliable_ext.publish(&envelope.channel, &json).await {
                                tracing::warn!("Mirror publish to {} failed: {}", envelope.channel, e);
                            }
                        }
                        if let Event::OrdersUpdated { order, .. } = &envelope.event {
                            if let Err(e) = reliable_ext
                                .mirror_hash(&StoreKey::order(order.id), &order.to_fields())
                                .await
                            {
                                tracing::warn!("Mirror of order {} failed: {}", order.id, e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Reliable mirror lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::warn!("Reliable-lane mirror worker stopped");
        });

        let mut snapshot_rx = bus.subscribe_snapshots();
        tokio::spawn(async move {
            tracing::info!("Snapshot-lane mirror worker started");
            loop {
                match snapshot_rx.recv().await {
                    Ok(envelope) => {
                        if let Ok(json) = serde_json::to_string(&envelope) {
                            if let Err(e) = external.publish(&envelope.channel, &json).await {
                                tracing::warn!("Mirror publish to {} failed: {}", envelope.channel, e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Snapshot mirror dropped {} stale frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::warn!("Snapshot-lane mirror worker stopped");
        });
    }

    // Build application state and router
    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        ledger,
        bus,
        engine,
        external,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::routes::create_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}
