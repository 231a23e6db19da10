use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::capability::CapabilitySet;
use super::lifecycle::SessionLifecycle;
use super::pipeline::{Orchestrator, PipelineOptions};
use super::session::{SessionStore, spawn_sweeper};
use super::ws;
use crate::config::RcaConfig;

/// Configuration for the RCA server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub pipeline: PipelineOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            dev_mode: false,
            session_ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            pipeline: PipelineOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &RcaConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            dev_mode: config.server.dev,
            session_ttl: config.sessions.ttl(),
            sweep_interval: config.sessions.sweep_interval(),
            pipeline: PipelineOptions::from_config(config),
        }
    }

    fn bind_addr(&self) -> String {
        let host = if self.dev_mode { "0.0.0.0" } else { self.host.as_str() };
        format!("{}:{}", host, self.port)
    }
}

/// Build the full application router: submit API plus the stream endpoint.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/{session_id}", get(ws::ws_handler))
        .with_state(state)
}

/// Start the RCA server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig, capabilities: CapabilitySet) -> Result<()> {
    let store = Arc::new(SessionStore::new());
    let lifecycle = SessionLifecycle::new(
        store.clone(),
        Orchestrator::new(capabilities, config.pipeline.clone()),
    );
    let state = AppState::new(lifecycle);

    let shutdown = CancellationToken::new();
    let sweeper = spawn_sweeper(
        store,
        config.session_ttl,
        config.sweep_interval,
        shutdown.clone(),
    );

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("rootcause listening on http://{}", local_addr);
    tracing::info!(
        %local_addr,
        stage_timeout_secs = config.pipeline.stage_timeout.as_secs(),
        join_policy = %config.pipeline.join_policy,
        "server started"
    );

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    shutdown.cancel();
    let _ = sweeper.await;
    result?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
