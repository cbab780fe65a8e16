//! HTTP send entrypoint.
//!
//! `GET /send/:user` produces one record and answers 200 with no body. The
//! send is fire-and-forget: broker failures are logged, never reported to the
//! HTTP caller.

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::HttpConfig;
use crate::producer::ProducerFacade;

#[derive(Clone)]
pub struct HttpState {
    pub producer: ProducerFacade,
    pub topic: String,
    pub key: String,
}

impl HttpState {
    pub fn new(producer: ProducerFacade, config: &HttpConfig) -> Self {
        Self {
            producer,
            topic: config.topic.clone(),
            key: config.key.clone(),
        }
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/send/:user", get(send_user))
        .with_state(state)
}

/// Message body produced for a user
pub fn user_message(user: &str) -> String {
    format!("{} test message send~", user)
}

pub async fn send_user(State(state): State<HttpState>, Path(user): Path<String>) -> StatusCode {
    debug!("🌐 Send requested for '{}'", user);
    state
        .producer
        .send_and_forget(&state.topic, Some(&state.key), user_message(&user));
    StatusCode::OK
}

/// Serve until a shutdown signal arrives
pub async fn serve(config: &HttpConfig, state: HttpState, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind HTTP entrypoint on {}", config.bind))?;
    info!("🌐 HTTP entrypoint listening on {}", config.bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("HTTP entrypoint failed")?;

    info!("✅ HTTP entrypoint stopped");
    Ok(())
}
