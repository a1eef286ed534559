//! Gateway HTTP server: health endpoint and the channel webhook.

use crate::activity::Activity;
use crate::channel::ConnectorClient;
use crate::config::{self, Config};
use crate::directline::DirectLineClient;
use crate::relay::{SessionSettings, Supervisor};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub supervisor: Arc<Supervisor>,
}

/// Session timing from config.
fn session_settings(config: &Config) -> SessionSettings {
    SessionSettings {
        poll_interval: Duration::from_millis(config.relay.poll_interval_ms),
        idle_timeout: Duration::from_millis(config.relay.idle_timeout_ms),
        max_duration: Duration::from_millis(config.relay.max_session_ms),
    }
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, gateway.allowPublicBind must be set (channel
/// authentication lives upstream of this process). Blocks until shutdown.
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "refusing to bind gateway to {} without gateway.allowPublicBind (channel auth is handled upstream)",
            bind
        );
    }

    let client = DirectLineClient::new(config.relay.direct_line_base_url.clone());
    let supervisor = Arc::new(Supervisor::new(
        client,
        Arc::new(ConnectorClient::new()),
        session_settings(&config),
        config::resolve_relay_token(&config),
    ));

    let state = GatewayState {
        config: Arc::new(config.clone()),
        supervisor: Arc::clone(&supervisor),
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/api/messages", post(channel_webhook))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(supervisor))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or
/// SIGTERM). Ends the active relay session first so its closing notice
/// goes out before the listener stops.
async fn shutdown_signal(supervisor: Arc<Supervisor>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing the active relay session");

    supervisor.end_session().await;
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "relayConversationId": state.supervisor.active_conversation_id().await,
    }))
}

/// POST /api/messages — receives one channel activity JSON and hands it
/// to the supervisor. The supervisor never fails the event pipeline.
async fn channel_webhook(State(state): State<GatewayState>, body: Bytes) -> StatusCode {
    let activity: Activity = match serde_json::from_slice(&body) {
        Ok(activity) => activity,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    state.supervisor.handle_activity(activity).await;
    StatusCode::OK
}
