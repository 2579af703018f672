use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use finsight::api::auth::{self as api_auth, ApiKeys};
use finsight::api::{handler, ApiState};
use finsight::config::AppConfig;
use finsight::governor::cache::ResponseCache;
use finsight::governor::tracker::UsageTracker;
use finsight::governor::Governor;
use finsight::journal;
use finsight::storage;
use finsight::upstream::UpstreamClient;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

const MAX_BODY_BYTES: usize = 256 * 1024;

#[derive(Parser)]
#[command(name = "finsight", about = "Usage governor and response cache for AI search APIs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the listen port from config
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "finsight=info,tower_http=warn".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(Some(&cli.config))?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if let Err(msg) = config.validate() {
        eprintln!("Configuration error: {msg}");
        return Err(msg.into());
    }

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        db = %config.database.path.display(),
        "starting finsight"
    );

    // Setup SQLite pool
    let pool = storage::sqlite::create_pool(&config.database)?;
    storage::sqlite::init_pool(&pool).await?;
    tracing::info!("database initialized");

    // Warm-start the usage tracker from the journal so quota windows
    // survive restarts
    let tracker = Arc::new(UsageTracker::new(config.usage.history_cap));
    match storage::writer::load_recent(&pool, config.usage.history_cap).await {
        Ok(records) => {
            let count = records.len();
            for record in records {
                tracker.push(record);
            }
            if count > 0 {
                tracing::info!(records = count, "warm-started usage tracker");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to load usage history, starting empty");
        }
    }

    // Journal channel + worker
    let (journal_tx, journal_rx) = mpsc::channel(config.usage.channel_capacity);
    let worker_pool = pool.clone();
    let usage_config = config.usage.clone();
    let journal_handle = tokio::spawn(async move {
        journal::run_worker(journal_rx, worker_pool, usage_config).await;
    });

    // Spawn retention background task
    let retention_pool = pool.clone();
    let retention_days = config.usage.retention_days;
    let retention_interval = config.usage.retention_sweep_secs;
    tokio::spawn(async move {
        storage::retention::retention_loop(retention_pool, retention_days, retention_interval)
            .await;
    });

    // Governor core
    let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
    let cache = Arc::new(ResponseCache::new(config.cache.max_entries));
    let governor = Arc::new(Governor::new(
        tracker.clone(),
        cache,
        upstream,
        &config,
        Some(journal_tx.clone()),
    ));

    // API key digests
    let api_keys = Arc::new(ApiKeys::from_config(&config.auth));
    if !api_keys.auth_enabled() {
        tracing::warn!("no api_keys configured, public endpoints are unauthenticated");
    }

    let api_state = Arc::new(ApiState {
        governor,
        default_model: config.upstream.default_model.clone(),
    });

    // Rate limiter for public routes
    let rate_limit_conf = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_second(config.rate_limit.per_second)
        .burst_size(config.rate_limit.burst_size)
        .finish()
        .expect("failed to build rate limiter config");

    // CORS: restrict to configured origins, or allow any when none are set
    let allow_origin = if config.server.cors_origins.is_empty() {
        AllowOrigin::any()
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };
    let cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ]);

    // ── Public routes (API-key auth, rate-limited) ──
    let public_routes = Router::new()
        .route("/v1/search", post(handler::search))
        .route("/v1/chat", post(handler::chat))
        .route("/v1/usage", get(handler::usage))
        .route("/v1/limits", get(handler::limits))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(api_auth::require_api_key))
        .layer(axum::Extension(api_keys.clone()))
        .layer(GovernorLayer::new(rate_limit_conf))
        .with_state(api_state.clone());

    // ── Admin routes (admin-key auth) ──
    let admin_routes = Router::new()
        .route("/v1/admin/usage/reset", post(handler::reset_usage))
        .route("/v1/admin/cache/invalidate", post(handler::invalidate_cache))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(api_auth::require_admin_key))
        .layer(axum::Extension(api_keys))
        .with_state(api_state);

    // ── Health route (public) ──
    let health_route = Router::new().route("/health", get(handler::health));

    let app = Router::new()
        .merge(public_routes)
        .merge(admin_routes)
        .merge(health_route)
        .layer(cors);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(journal_tx, journal_handle))
        .await?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(
    journal_tx: mpsc::Sender<finsight::governor::tracker::CallRecord>,
    journal_handle: tokio::task::JoinHandle<()>,
) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutting down...");

    // Drop sender to signal the journal worker to drain
    drop(journal_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), journal_handle).await;
}
