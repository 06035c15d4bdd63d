use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::SqlitePool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::{Config, CounterStoreBackend, RateLimitConfig},
    db, handlers,
    handlers::AppState,
    metrics,
    pricing::PricingTable,
    ratelimit::{rate_limit_middleware, CounterStore, MemoryCounterStore, RateLimiter, SqliteCounterStore},
    signals::setup_signal_handlers,
    telemetry::{SqliteSink, TelemetryPipeline},
};

/// How often the in-memory counter store drops expired windows
const COUNTER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Request bodies above this size are rejected
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Start the telemetry server
///
/// This function:
/// 1. Initializes metrics and signal handlers
/// 2. Opens the database and starts the telemetry pipeline
/// 3. Builds the rate limiter over the configured counter store
/// 4. Serves requests until SIGTERM/SIGINT
/// 5. Stops the pipeline, waiting for its final flush
pub async fn start_server(config: Config) -> Result<()> {
    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    let (shutdown_tx, signal_handle) = setup_signal_handlers();
    let mut shutdown_rx = shutdown_tx.subscribe();

    let pool = db::connect(&config.database.url).await?;
    let sink = Arc::new(SqliteSink::from_pool(pool.clone()));
    let pipeline = Arc::new(TelemetryPipeline::start(sink, &config.pipeline));

    let limiter = build_rate_limiter(&config.rate_limit, &config.database.url, &pool).await?;

    let state = AppState {
        pipeline: pipeline.clone(),
        limiter,
        pricing: Arc::new(PricingTable::from_config(&config.pricing)),
        exempt_paths: Arc::new(config.rate_limit.exempt_paths.clone()),
    };

    let app = create_router(state, metrics_handle);

    let served = async {
        let addr = SocketAddr::from((
            config.server.host.parse::<std::net::IpAddr>()?,
            config.server.port,
        ));

        info!("Starting telemetry server on {}", addr);
        info!(
            "Configuration: batch size {}, flush interval {}s, rate limit {}/min {}/hour ({})",
            config.pipeline.batch_size,
            config.pipeline.flush_interval_secs,
            config.rate_limit.per_minute,
            config.rate_limit.per_hour,
            if config.rate_limit.enabled { "enabled" } else { "disabled" }
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received, draining connections...");
            })
            .await?;

        anyhow::Ok(())
    }
    .await;

    // Flush whatever is still queued, even if the server failed
    pipeline.shutdown().await;
    signal_handle.abort();

    served?;
    info!("Server stopped gracefully");

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub fn create_router(state: AppState, metrics_handle: Arc<PrometheusHandle>) -> Router {
    let api_routes = Router::new()
        .route("/api/events", post(handlers::events::submit_event))
        .route("/health", get(handlers::health::health_check))
        .with_state(state.clone());

    Router::new()
        .route("/metrics", get(handlers::metrics_handler::metrics))
        .with_state(metrics_handle)
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(state, rate_limit_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
}

/// Build the limiter over the configured counter store, `None` when disabled
///
/// The SQLite backend reuses `pool` when it points at the main database.
pub async fn build_rate_limiter(
    config: &RateLimitConfig,
    database_url: &str,
    pool: &SqlitePool,
) -> Result<Option<RateLimiter>> {
    if !config.enabled {
        info!("Rate limiting disabled");
        return Ok(None);
    }

    let store: Arc<dyn CounterStore> = match config.counter_store.backend {
        CounterStoreBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            store.spawn_sweeper(COUNTER_SWEEP_INTERVAL);
            store
        }
        CounterStoreBackend::Sqlite => {
            let url = config.counter_store.url.as_deref().unwrap_or(database_url);
            if url == database_url {
                Arc::new(SqliteCounterStore::from_pool(pool.clone()))
            } else {
                let store = SqliteCounterStore::connect(url)
                    .await
                    .with_context(|| format!("Failed to open counter store at {}", url))?;
                Arc::new(store)
            }
        }
    };

    info!(
        backend = ?config.counter_store.backend,
        per_minute = config.per_minute,
        per_hour = config.per_hour,
        "Rate limiter ready"
    );

    Ok(Some(
        RateLimiter::new(store, config.per_minute, config.per_hour)
            .with_window_slack(Duration::from_secs(config.window_slack_secs)),
    ))
}
