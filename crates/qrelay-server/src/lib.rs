// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP surface and request pipeline of the qrelay gateway.
//!
//! Inbound Anthropic-Messages and OpenAI-Chat-Completions requests are
//! authenticated, optionally compressed, translated to the Amazon Q wire
//! format, dispatched across the account pool with fail-over, and streamed
//! back in the caller's dialect.

mod auth;
mod error;
mod loghub;
mod pipeline;
mod ready;
mod routes;
mod state;
pub mod testing;

pub use error::GatewayError;
pub use loghub::{LogHub, RequestLogEntry};
pub use pipeline::{handle_chat, ChatDispatch, ChatReply, Dialect, EventByteStream};
pub use ready::{ensure_ready, status_for_code, TokenFlows};
pub use state::{Gateway, GatewayBuilder};

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

/// Serve the gateway until the shutdown signal flips.
///
/// Spawns the background maintenance tasks (pool refresh, refresher
/// cleanup) on the same shutdown signal before accepting connections.
pub async fn serve(
    gateway: Arc<Gateway>,
    listen: &str,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tokio::spawn(gateway.pool.clone().run(shutdown.clone()));
    tokio::spawn(gateway.refresher.clone().run(shutdown.clone()));

    let app = routes::router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, "qrelay gateway listening");

    let mut shutdown = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("HTTP server failed")
}
