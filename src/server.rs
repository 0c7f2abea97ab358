//! Server assembly and lifecycle.
//!
//! Binds the real collaborators (Gemini, SerpAPI) to the core services,
//! mounts the API router, and serves until ctrl-c.

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{AppState, api_router};
use crate::config::Config;
use crate::genai::GeminiGenerator;
use crate::shopping::SerpShoppingClient;
use crate::store::{Store, StoreHandle};

pub async fn start(config: Config) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }

    let store = StoreHandle::new(
        Store::open(&config.db_path).context("Failed to open the visage database")?,
    );
    let generator = Arc::new(GeminiGenerator::new(
        config.gemini_api_key.as_str(),
        config.gemini_base_url.as_str(),
        config.gemini_model.as_str(),
        config.generation_timeout,
    )?);
    let search = Arc::new(SerpShoppingClient::new(
        config.serpapi_key.as_str(),
        config.serpapi_base_url.as_str(),
        config.search_language.as_str(),
        config.search_country.as_str(),
        config.search_timeout,
    )?);

    let state = AppState::new(store, generator, search, config.resolve_concurrency);
    let mut app = api_router().with_state(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!(addr = %listener.local_addr()?, db = %config.db_path.display(), "visage listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("shutting down");
}
