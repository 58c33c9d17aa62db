//! Webhook ingress: one shared axum router for every hosted bot.
//!
//! Telegram posts updates to `/webhook/{bot_id}`; the handler validates
//! the bot id and per-bot secret, then hands the decoded update to that
//! bot's pipeline. The handler itself never generates replies, so the
//! response to Telegram is immediate.

use crate::registry::BotRegistry;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use aviary_telegram::types::Update;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info};

const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BotRegistry>,
}

pub fn build_router(registry: Arc<BotRegistry>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/webhook/{bot_id}", post(webhook))
        .with_state(AppState { registry })
}

/// Bind and serve until ctrl-c.
pub async fn serve(registry: Arc<BotRegistry>, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("webhook server listening on {addr}");

    axum::serve(listener, build_router(registry))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "bots": state.registry.ids() }))
}

async fn webhook(
    State(state): State<AppState>,
    Path(bot_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let bot_id = bot_id.to_lowercase();
    let Some(entry) = state.registry.lookup(&bot_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": "unknown bot" })),
        )
            .into_response();
    };

    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !constant_time_eq(presented, &entry.secret) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "detail": "bad secret" })),
        )
            .into_response();
    }

    // The body is only decoded once the request is authenticated.
    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            debug!("[{bot_id}] rejected malformed update: {e}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "detail": "malformed update" })),
            )
                .into_response();
        }
    };

    // An enqueue failure must not make Telegram retry the update, so the
    // response stays 200 and the loss is logged instead.
    if let Err(e) = entry.queue.try_send(update) {
        error!("[{bot_id}] pipeline queue rejected update: {e}");
    }

    Json(json!({ "ok": true })).into_response()
}

/// Compare strings without early exit on mismatch position.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
