use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::{routing::get, Router};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cache;
mod config;
mod db;
mod metrics;
mod models;
mod services;
mod utils;
mod websocket;

use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::db::Database;
use crate::models::Asset;
use crate::services::ledger::Ledger;
use crate::services::market_maker::MarketMakerService;
use crate::services::matching::{orchestrator, MatchingEngine};
use crate::services::price_feed::PriceFeedService;
use crate::services::registry::Registry;
use crate::services::ticker::TickerService;
use crate::websocket::bridge;
use crate::websocket::bus::FanoutBus;

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub registry: Arc<Registry>,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<MatchingEngine>,
    pub bus: Arc<FanoutBus>,
    pub ticker: Arc<TickerService>,
    pub metrics: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spotdx_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting spotdx backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Environment: {}", config.server.environment);

    let metrics_handle = metrics::init()?;

    // Database
    let db = Database::connect(&config.persistence.url, config.persistence.max_connections).await?;
    tracing::info!("Database connected");

    // Cache (Redis with in-process fallback)
    let cache = Arc::new(
        CacheManager::new(
            config.cache.url.as_deref(),
            Duration::from_secs(config.external_feed.price_ttl_secs),
        )
        .await,
    );
    if cache.is_redis_available() {
        tracing::info!("Cache manager initialized with Redis");
    } else {
        tracing::warn!("Cache manager running without Redis (in-process only)");
    }

    // Asset / pair registry from config
    let registry = Arc::new(Registry::new());
    for asset in config.assets() {
        registry.register_asset(asset);
    }
    let trading_pairs = config.trading_pairs();
    for pair in &trading_pairs {
        for leg in [&pair.base, &pair.quote] {
            if registry.asset(leg).is_none() {
                tracing::warn!("asset {} not declared, registering with defaults", leg);
                registry.register_asset(Asset {
                    symbol: leg.clone(),
                    chain: "native".to_string(),
                    decimals: 8,
                    min_deposit: rust_decimal::Decimal::ZERO,
                    min_withdrawal: rust_decimal::Decimal::ZERO,
                    active: true,
                });
            }
        }
        registry.register_pair(pair.clone())?;
    }
    let pair_symbols: Vec<String> = trading_pairs.iter().map(|p| p.symbol.clone()).collect();
    tracing::info!("Trading pairs enabled: {:?}", pair_symbols);

    // Ledger, seeded from the durable balance snapshots
    let ledger = Arc::new(Ledger::new());
    let seeded = db.all_balances().await?;
    for balance in &seeded {
        ledger.seed_account(balance.user_id, &balance.asset, balance.available, balance.locked);
    }
    tracing::info!("Ledger seeded with {} balance rows", seeded.len());

    // Matching engine, book rebuilt from resting order rows
    let engine = Arc::new(MatchingEngine::new(
        registry.clone(),
        ledger.clone(),
        config.trading.allow_self_match,
    ));
    let resting = db.resting_orders().await?;
    let restored = resting.len();
    for order in resting {
        if let Err(e) = engine.restore_resting_order(order) {
            tracing::error!("failed to restore resting order: {}", e);
        }
    }
    if restored > 0 {
        tracing::info!("Recovered {} resting orders into the book", restored);
    } else {
        tracing::info!("No resting orders to recover");
    }

    // Persistence workers trail the in-memory core
    orchestrator::start_persistence_workers(db.clone(), engine.clone(), &ledger);
    tracing::info!("Persistence workers spawned");

    // Fan-out bus, engine bridge, coalesced ticker flusher
    let bus = Arc::new(FanoutBus::new(config.bus.max_per_session_queue));
    let ticker = Arc::new(TickerService::new());
    bridge::start_event_bridge(
        bus.clone(),
        engine.clone(),
        ticker.clone(),
        config.bus.book_depth,
    );
    bridge::start_ticker_flusher(
        bus.clone(),
        engine.clone(),
        ticker.clone(),
        Duration::from_millis(config.bus.ticker_interval_ms),
    );
    tracing::info!("Fan-out bus started (queue depth {})", config.bus.max_per_session_queue);

    // Cooperative shutdown for the background actors
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // External reference price poller
    match PriceFeedService::new(&config.external_feed, pair_symbols.clone(), cache.clone()) {
        Some(feed) => feed.start(shutdown_rx.clone()),
        None => tracing::info!("External price feed not configured"),
    }

    // Market maker
    let market_maker = Arc::new(MarketMakerService::new(
        config.market_maker.clone(),
        engine.clone(),
        ledger.clone(),
        registry.clone(),
        cache.clone(),
    ));
    if config.market_maker.enabled && !ledger.user_known(config.market_maker.user_id) {
        market_maker.seed_funding();
    }
    market_maker.start(shutdown_rx.clone());

    // Close websocket sessions once the shutdown signal lands
    {
        let bus = bus.clone();
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                if *rx.borrow() {
                    bus.close_all();
                    break;
                }
            }
        });
    }

    // Application state and router
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        registry,
        ledger,
        engine,
        bus,
        ticker,
        metrics: metrics_handle,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api::routes::create_router(state.clone()))
        .nest("/ws", websocket::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// SIGINT/SIGTERM: market maker and poller stop first, in-flight requests
/// drain, sessions close, then the server returns.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping background actors");
    let _ = shutdown_tx.send(true);
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}
