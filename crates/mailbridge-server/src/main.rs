//! Webmail relay server: WebSocket gateway for browser clients, HTTP
//! settings API, and the outbound control-plane link.

mod auth;
mod config;
mod gateway;
mod registry;
mod settings;
mod upstream;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mailbridge_core::SqliteMailStore;
use registry::SessionRegistry;

pub struct AppState {
    pub store: SqliteMailStore,
    pub registry: SessionRegistry,
    pub jwt_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config::load();
    let store = SqliteMailStore::connect(&config.database_path).await?;
    store.init().await?;

    let state = Arc::new(AppState {
        store: store.clone(),
        registry: SessionRegistry::new(store),
        jwt_secret: config.jwt_secret.clone(),
    });

    {
        let state = state.clone();
        let url = config.upstream_url.clone();
        tokio::spawn(async move {
            // Losing the control-plane link tears the process down; the
            // supervisor restarts it into a clean state.
            if let Err(err) = upstream::run(state, &url).await {
                error!(error = %err, "upstream link lost, shutting down");
                std::process::exit(1);
            }
        });
    }

    let app = Router::new()
        .route("/ws", get(gateway::ws_handler))
        .nest("/api/settings", settings::router())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "mailbridge server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
