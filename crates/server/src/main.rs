mod challenge;
mod config;
mod error;
mod handler;
mod players;
mod session;
mod shutdown;
mod store;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::challenge::directory::ChallengeDirectory;
use crate::config::ServerConfig;
use crate::handler::MessageHandler;
use crate::players::PlayerDirectory;
use crate::session::{SessionRegistry, StaticTokenAuthenticator};
use crate::shutdown::ServerStatusManager;
use crate::store::MemoryStore;
use crate::ws::WsRouterState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = Arc::new(SessionRegistry::default());
    let store = Arc::new(MemoryStore::default());
    let players = Arc::new(PlayerDirectory::new(store.clone()));
    let directory = ChallengeDirectory::new(registry.clone(), store, players.clone());
    let status = ServerStatusManager::new(registry.clone(), directory.clone());
    let handler = Arc::new(MessageHandler::new(registry.clone(), directory, players));
    let authenticator = Arc::new(StaticTokenAuthenticator::from_spec(&config.api_tokens));

    let app = build_router(WsRouterState {
        authenticator,
        registry,
        handler,
        status: status.clone(),
    });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting chronicle event server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(status))
        .await
        .context("event server exited unexpectedly")
}

fn build_router(state: WsRouterState) -> Router {
    Router::new().route("/healthz", get(healthz)).merge(ws::router(state))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal(status: Arc<ServerStatusManager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = status.wait_for_shutdown() => {}
    }

    info!("shutdown signal received");
}
