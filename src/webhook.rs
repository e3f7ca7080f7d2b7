use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::strategy::entry::EntryExecutor;
use crate::strategy::types::SignalOutcome;

#[derive(Clone)]
pub struct WebhookState {
    pub executor: Arc<EntryExecutor>,
    pub passphrase: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
struct SignalPayload {
    signal: Option<String>,
    symbol: Option<String>,
    passphrase: Option<String>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/webhook", post(webhook))
        .with_state(state)
}

async fn liveness() -> &'static str {
    "bybit-signal-trader is running"
}

async fn webhook(State(state): State<WebhookState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let (status, body) = process_webhook(&state, &body).await;
    (status, Json(body))
}

fn bad_request(message: &str) -> (StatusCode, Value) {
    (StatusCode::BAD_REQUEST, json!({ "error": message }))
}

/// Decode one alert, run it through the engine and map the result to an
/// HTTP status and JSON body.
pub async fn process_webhook(state: &WebhookState, raw: &[u8]) -> (StatusCode, Value) {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return bad_request("empty body");
    }

    let payload: SignalPayload = match serde_json::from_slice(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "[WEBHOOK] Undecodable body");
            return bad_request("invalid JSON");
        }
    };

    if let Some(expected) = &state.passphrase {
        if payload.passphrase.as_deref() != Some(expected.as_ref()) {
            warn!("[WEBHOOK] Passphrase mismatch");
            return (StatusCode::UNAUTHORIZED, json!({ "error": "unauthorized" }));
        }
    }

    let (Some(signal), Some(symbol)) = (payload.signal, payload.symbol) else {
        return bad_request("signal and symbol are required");
    };

    info!(%signal, %symbol, "[WEBHOOK] Signal received");

    match state.executor.handle_signal(&signal, &symbol).await {
        Ok(outcome) => {
            let message = format!("{} processed", signal.trim().to_lowercase());
            let body = match outcome {
                SignalOutcome::Opened(position) => json!({
                    "message": message,
                    "status": "opened",
                    "protected": !position.protection.is_unprotected(),
                    "position": position,
                }),
                SignalOutcome::AlreadyOpen => json!({
                    "message": message,
                    "status": "already_open",
                }),
                SignalOutcome::Skipped { reason } => json!({
                    "message": message,
                    "status": "skipped",
                    "reason": reason,
                }),
            };
            (StatusCode::OK, body)
        }
        Err(e) => {
            warn!(%signal, %symbol, error = %e, "[WEBHOOK] Signal failed");
            let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, json!({ "error": e.to_string(), "reason": e.reason() }))
        }
    }
}
