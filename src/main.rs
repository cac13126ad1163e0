mod cache;
mod catalog;
mod config;
mod db;
mod error;
mod proxy;
mod scheduler;

#[cfg(test)]
mod reservation_tests;

use std::sync::Arc;

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::Cache;
use crate::catalog::AssignmentCatalog;
use crate::config::AppConfig;
use crate::db::Database;
use crate::scheduler::Engine;

/// Shared application state available to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub catalog: AssignmentCatalog,
    pub engine: Engine,
    pub http: reqwest::Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maestro_gateway=info,tower_http=info".into()),
        )
        .init();

    info!("Starting Maestro Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    // Connect the assignment store and its cache
    let db = Database::connect(&config.database_url()).await?;
    info!("Database connection established");

    let cache = Cache::connect(&config.redis_url()).await?;
    info!("Cache connection established");

    // Build the reservation engine
    let catalog = AssignmentCatalog::new(db, cache);
    let engine = Engine::new(catalog.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        catalog,
        engine,
        http: reqwest::Client::new(),
    });

    // Build router
    let app = build_router(state);

    // Start server
    let addr = config.listen_addr.parse::<std::net::SocketAddr>()?;
    info!("Gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/txt2img", post(proxy::inference_handler))
        .route("/img2img", post(proxy::inference_handler))
        .route("/api/generate", post(proxy::inference_handler))
        .route("/api/chat", post(proxy::inference_handler))
        .route("/api/embeddings", post(proxy::inference_handler))
        .route("/cache", delete(proxy::clear_cache_handler))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024)) // 10 MB
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
