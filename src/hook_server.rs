//! HTTP endpoint for tool completion callbacks.
//!
//! Hook-driven tools call `POST /hook?cli_type=<tool>` when a turn ends.
//! The body is handed to the engine untouched; the per-tool parser decides
//! what it means.

use crate::engine::{Engine, HookOutcome};
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct HookQuery {
    cli_type: Option<String>,
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/hook", any(handle_hook))
        .with_state(engine)
}

async fn handle_hook(
    State(engine): State<Engine>,
    method: Method,
    Query(query): Query<HookQuery>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if method != Method::POST {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "use POST" })),
        );
    }
    let Some(cli_type) = query.cli_type.filter(|t| !t.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "missing cli_type" })),
        );
    };

    match engine.handle_hook(&cli_type, &body).await {
        Ok(outcome) => {
            let outcome = match outcome {
                HookOutcome::Delivered => "delivered",
                HookOutcome::Capturing => "capturing",
                HookOutcome::NoChannel => "no_channel",
            };
            (
                StatusCode::OK,
                Json(json!({ "success": true, "outcome": outcome })),
            )
        }
        Err(e) => {
            warn!(cli_type = %cli_type, "Hook rejected: {}", e);
            let status =
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}

/// Bound hook listener, not yet serving
pub struct HookServer {
    listener: TcpListener,
    engine: Engine,
}

impl HookServer {
    pub async fn bind(addr: &str, engine: Engine) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context(format!("Failed to bind hook listener on {}", addr))?;
        Ok(Self { listener, engine })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Hook listener has no local address")
    }

    /// Serve until `shutdown` fires, then finish in-flight requests
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Hook endpoint listening on {}", self.local_addr()?);
        axum::serve(self.listener, router(self.engine))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Hook server failed")?;
        info!("Hook endpoint stopped");
        Ok(())
    }
}
