//! Market-data collector entrypoint: wires the metadata store, time-series
//! gateway, message bus, and inventory cache, then spawns the scheduler,
//! inventory loader, and rollover recalculator background tasks alongside
//! a thin HTTP status surface.
//!
//! Grounded on the teacher's `main.rs`: `init_tracing()` via
//! `tracing_subscriber::registry()` + `EnvFilter`, sequential `Arc::new(...)`
//! construction of shared state, `tokio::spawn` per background task, and an
//! axum router built from layered `CorsLayer` + request-logging middleware.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use betterbot_collector::adapter::{FakeAdapterClient, HttpPlatformAdapterClient, PlatformAdapterClient};
use betterbot_collector::api::{self, AppState};
use betterbot_collector::bus::{BroadcastMessageBus, BusEvent};
use betterbot_collector::cache::{InventoryCache, UserConnection};
use betterbot_collector::config::Config;
use betterbot_collector::error::AdapterError;
use betterbot_collector::inventory_loader::InventoryLoader;
use betterbot_collector::model::{ConnectionStatus, IntDate, PriceBars, UpstreamInstrument};
use betterbot_collector::query_planner::QueryPlanner;
use betterbot_collector::rollover::RolloverRecalculator;
use betterbot_collector::runner::{Runner, RunnerConfig};
use betterbot_collector::scheduler::Scheduler;
use betterbot_collector::store::SqliteMetadataStore;
use betterbot_collector::timeseries::InMemoryTimeSeriesGateway;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "betterbot_collector=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Dispatches to whichever concrete adapter is configured. The Runner is
/// generic over `PlatformAdapterClient` rather than boxed as a trait
/// object, so this enum is how a single binary picks between the live and
/// fake client at startup without duplicating the wiring below.
enum AnyAdapter {
    Http(HttpPlatformAdapterClient),
    Fake(FakeAdapterClient),
}

#[async_trait]
impl PlatformAdapterClient for AnyAdapter {
    async fn list_instruments(&self, user: &str, connection_code: &str, root: &str) -> Result<Vec<UpstreamInstrument>, AdapterError> {
        match self {
            AnyAdapter::Http(a) => a.list_instruments(user, connection_code, root).await,
            AnyAdapter::Fake(a) => a.list_instruments(user, connection_code, root).await,
        }
    }

    async fn get_bars(&self, user: &str, connection_code: &str, symbol: &str, day: IntDate) -> Result<PriceBars, AdapterError> {
        match self {
            AnyAdapter::Http(a) => a.get_bars(user, connection_code, symbol, day).await,
            AnyAdapter::Fake(a) => a.get_bars(user, connection_code, symbol, day).await,
        }
    }
}

/// Picks a live HTTP adapter when the upstream platform is configured,
/// falling back to the in-memory fake otherwise — the collector still
/// boots, and its scheduler/cache machinery is still exercisable, without a
/// real upstream connection configured.
fn build_adapter() -> AnyAdapter {
    match (env::var("PLATFORM_BASE_URL"), env::var("PLATFORM_API_KEY")) {
        (Ok(base_url), Ok(api_key)) => {
            info!(%base_url, "platform adapter client configured");
            AnyAdapter::Http(HttpPlatformAdapterClient::new(base_url, api_key))
        }
        _ => {
            info!("no PLATFORM_BASE_URL/PLATFORM_API_KEY configured, using the in-memory fake adapter");
            AnyAdapter::Fake(FakeAdapterClient::new())
        }
    }
}

/// Consumes the `system` topic (spec.md §6's connection-status protocol):
/// persists `connected` on the matching DataProduct(s) and mirrors the
/// flag into the InventoryCache, and on a `restart` message clears every
/// persisted `connected` flag and disconnects the whole cache.
async fn run_connection_status_listener(
    store: Arc<SqliteMetadataStore>,
    cache: Arc<InventoryCache>,
    bus: BroadcastMessageBus,
) {
    let mut rx = bus.subscribe_system();
    loop {
        match rx.recv().await {
            Ok(BusEvent::ConnectionChanged { system_code, username, connection_code, connected }) => {
                match store.list_products().await {
                    Ok(products) => {
                        for mut product in products {
                            if product.system_code == system_code
                                && product.owner == username
                                && product.connection_code == connection_code
                            {
                                product.connected = connected;
                                if let Err(err) = store.upsert_product(&product).await {
                                    warn!(error = %err, "failed to persist connection status");
                                }
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to list products for connection status update"),
                }
                let status = if connected { ConnectionStatus::Connected } else { ConnectionStatus::Disconnected };
                cache.set_connection(&system_code, UserConnection::new(&system_code, &username, &connection_code, status));
            }
            Ok(BusEvent::SystemRestart) => {
                match store.list_products().await {
                    Ok(products) => {
                        for mut product in products {
                            if product.connected {
                                product.connected = false;
                                if let Err(err) = store.upsert_product(&product).await {
                                    warn!(error = %err, "failed to clear connection status on restart");
                                }
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to list products on restart"),
                }
                cache.disconnect_all_systems();
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "connection-status listener lagged behind the bus");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("market-data collector starting");

    let config = Config::from_env().context("failed to load configuration")?;

    let store = Arc::new(
        SqliteMetadataStore::open(&config.database_path).context("failed to open metadata store")?,
    );
    let gateway = Arc::new(InMemoryTimeSeriesGateway::new(config.time_series_batch_rows));
    let cache = Arc::new(InventoryCache::new());
    let bus = BroadcastMessageBus::new();
    let adapter = Arc::new(build_adapter());

    let runner = Arc::new(Runner::new(
        store.clone(),
        gateway.clone(),
        bus.clone(),
        cache.clone(),
        adapter.clone(),
        config.max_concurrent_jobs,
        RunnerConfig {
            job_backoff_secs: config.job_backoff_secs,
            resume_warmup_secs: config.resume_warmup_secs,
        },
    ));

    let scheduler = Scheduler::new(
        cache.clone(),
        store.clone(),
        runner,
        config.max_concurrent_jobs,
        Duration::from_millis(config.scheduler_tick_ms),
    );
    scheduler.recover().await.context("scheduler boot recovery failed")?;

    let inventory_loader = InventoryLoader::new(
        store.clone(),
        cache.clone(),
        bus.clone(),
        adapter,
        Duration::from_secs(config.inventory_loader_tick_secs),
    );

    let rollover = RolloverRecalculator::new(
        store.clone(),
        gateway.clone(),
        bus.clone(),
        config.roll_sleep_defer_hours,
    );

    let connection_status_store = store.clone();
    let connection_status_cache = cache.clone();
    let connection_status_bus = bus.clone();

    tokio::spawn(async move { scheduler.run().await });
    tokio::spawn(async move { inventory_loader.run().await });
    tokio::spawn(async move { rollover.run().await });
    tokio::spawn(async move {
        run_connection_status_listener(connection_status_store, connection_status_cache, connection_status_bus).await
    });

    let query_planner = Arc::new(QueryPlanner::new(store.clone(), gateway));
    let app_state = AppState { store, query_planner };
    let app = api::router(app_state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            betterbot_collector::middleware::request_logging_simple,
        ));

    let addr = format!("0.0.0.0:{}", config.http_port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind HTTP listener")?;
    info!(%addr, "HTTP status surface listening");

    axum::serve(listener, app).await.context("HTTP server error")?;

    Ok(())
}
