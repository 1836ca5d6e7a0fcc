// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod routes;
mod service;

pub use routes::build_router;
pub use service::{AppState, LlmFactory};

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

/// Bind and serve until shutdown. `ready` flips once the listener is
/// accepting connections.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> anyhow::Result<()> {
    let router = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "agent server listening");
    state.mark_ready();
    axum::serve(listener, router).await?;
    Ok(())
}
