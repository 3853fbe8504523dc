// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tracing::info;

use aria_core::Orchestrator;

use crate::auth::AuthProvider;
use crate::error::NodeError;
use crate::ws::ws_handler;

/// Shared state for the HTTP layer.
pub struct NodeState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<dyn AuthProvider>,
}

pub fn router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Bind and serve until `shutdown` resolves.  Used by `aria serve`.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<NodeState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), NodeError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "node listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
