use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::db::{DbHandle, EditingDb};
use super::lifecycle::SessionSettings;
use super::remote::HttpAutomationEngine;
use super::sealer::{ChaChaSealer, DisabledSealer, SecretSealer};
use super::sweeper::ExpirySweeper;
use super::ws;
use crate::config::StepwrightConfig;

/// Configuration for the editing server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub engine_url: String,
    pub sealing_key: Option<String>,
    pub callback_key: Option<String>,
    pub sweep_interval: Duration,
    pub session: SessionSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&StepwrightConfig::default())
    }
}

impl From<&StepwrightConfig> for ServerConfig {
    fn from(config: &StepwrightConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            engine_url: config.engine.base_url.clone(),
            sealing_key: config.sealing.key.clone(),
            callback_key: config.engine.callback_key.clone(),
            sweep_interval: Duration::from_secs(config.session.sweep_interval_secs.max(1)),
            session: config.session_settings(),
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .route("/ws/subjects/{id}", get(ws::subject_ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Pick the sealer for confirmed sensitive values. Without a key the
/// server still runs, but confirmations that need sealing fail.
pub fn build_sealer(key: Option<&str>) -> Result<Arc<dyn SecretSealer>> {
    match key {
        Some(key) => {
            let sealer = ChaChaSealer::from_base64_key(key).context("Invalid sealing key")?;
            Ok(Arc::new(sealer))
        }
        None => {
            tracing::warn!("no sealing key configured; sensitive confirmations will be refused");
            Ok(Arc::new(DisabledSealer))
        }
    }
}

/// Start the editing server and its expiry sweeper.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = EditingDb::new(&config.db_path).context("Failed to initialize editing database")?;
    let engine = HttpAutomationEngine::new(&config.engine_url, config.session.command_timeout)
        .context("Failed to build automation engine client")?;
    let sealer = build_sealer(config.sealing_key.as_deref())?;

    let state = Arc::new(AppState::new(
        DbHandle::new(db),
        Arc::new(engine),
        sealer,
        config.session,
        config.callback_key,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = ExpirySweeper::new(state.sessions.clone());
    let sweeper_task = tokio::spawn(sweeper.run(config.sweep_interval, stop_rx));

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, engine = %config.engine_url, "stepwright listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    let _ = stop_tx.send(true);
    if let Err(e) = sweeper_task.await {
        tracing::warn!(error = %e, "expiry sweeper did not stop cleanly");
    }
    served?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
    tracing::info!("shutting down");
}
