// handlers/mpesa_handlers.rs
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::models::mpesa::CallbackData;
use crate::state::AppState;

/// Body Daraja expects back. Anything else makes it redeliver.
fn accepted() -> Json<serde_json::Value> {
    Json(json!({
        "ResultCode": 0,
        "ResultDesc": "Accepted"
    }))
}

/// STK callback. Always acknowledged; unauthenticated or unparseable payloads
/// are logged and dropped without touching the ledger.
pub async fn mpesa_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let (Some(auth), Some(payments)) = (&state.callback_auth, &state.payments) else {
        warn!("M-Pesa callback received but payments are not configured");
        return accepted();
    };

    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok());

    if let Err(e) = auth.authenticate(&body, signature) {
        warn!(
            signature_present = signature.is_some(),
            "Rejected M-Pesa callback: {}", e
        );
        return accepted();
    }

    let payload: CallbackData = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Unparseable M-Pesa callback: {}", e);
            return accepted();
        }
    };

    let callback = payload.body.stk_callback;
    info!(
        checkout_request_id = %callback.checkout_request_id,
        result_code = callback.result_code,
        "Received M-Pesa callback: {}", callback.result_desc
    );

    if let Err(e) = payments.apply_callback(&callback).await {
        error!(
            checkout_request_id = %callback.checkout_request_id,
            "Failed to apply M-Pesa callback: {}", e
        );
    }

    accepted()
}

pub async fn mpesa_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": if state.payments.is_some() { "ok" } else { "disabled" },
        "service": "mpesa",
        "live_pollers": state.payments.as_ref().map(|p| p.live_pollers()).unwrap_or(0),
        "timestamp": Utc::now().to_rfc3339(),
        "features": ["stk-push", "stk-query", "callback", "reconciliation"]
    }))
}

pub async fn mpesa_config(State(state): State<AppState>) -> impl IntoResponse {
    match &state.mpesa_config {
        Some(config) => Json(json!({
            "configured": true,
            "config": config.get_config_info(),
        })),
        None => Json(json!({ "configured": false })),
    }
}
