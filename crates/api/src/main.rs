//! Deskline API server

use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::EnvFilter;

use deskline_api::{
    blob_store::{BlobStore, HttpBlobStore},
    broker::spawn_sweeper,
    notifications::WebhookNotifier,
    routes::create_router,
    AppState, Config,
};
use deskline_shared::{create_pool, run_migrations, MemoryStore, PgStore, RecordStore};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,deskline_api=debug"));
    let json = std::env::var("LOG_FORMAT").map(|f| f.eq_ignore_ascii_case("json")).unwrap_or(false);

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn RecordStore>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using the in-memory store, nothing will persist");
        return Ok(Arc::new(MemoryStore::new()));
    };

    let pool = create_pool(url, config.database_max_connections)
        .await
        .context("failed to connect to the database")?;
    run_migrations(&pool).await.context("failed to run migrations")?;
    tracing::info!("Database ready");

    Ok(Arc::new(PgStore::new(pool)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("invalid configuration")?;
    let store = open_store(&config).await?;

    // In-memory presence does not survive a restart
    let reset = store.reset_presence().await.context("failed to reset presence")?;
    if reset > 0 {
        tracing::info!(records = reset, "Reset stale presence from a previous run");
    }

    let notifier = Arc::new(WebhookNotifier::new(config.notify_webhook_url.clone()));
    let blob_store = config
        .blob_store_url
        .clone()
        .map(|url| Arc::new(HttpBlobStore::new(url)) as Arc<dyn BlobStore>);
    if blob_store.is_none() {
        tracing::warn!("BLOB_STORE_URL not set; attachment uploads are disabled");
    }

    let bind_address = config.bind_address.clone();
    let sweep_interval = config.sweep_interval();
    let cors = cors_layer(&config.cors_allowed_origins);

    let state = AppState::new(config, store, notifier, blob_store);
    let sweeper = spawn_sweeper(state.broker.clone(), sweep_interval);

    let app = create_router(state).layer(TraceLayer::new_for_http()).layer(cors);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Deskline API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    sweeper.abort();
    Ok(())
}
