// handlers/payment_handlers.rs
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::info;
use validator::Validate;

use crate::dtos::payment_dtos::{CancelPayload, PaymentHistoryResponse, PaymentResponse, StkPushPayload};
use crate::errors::{AppError, Result};
use crate::models::payment_attempt::{PaymentAttempt, PaymentStatusView};
use crate::services::payment_service::{InitiatePayment, PaymentService};
use crate::state::AppState;

fn payments(state: &AppState) -> Result<&Arc<PaymentService>> {
    state
        .payments
        .as_ref()
        .ok_or_else(|| AppError::ServiceUnavailable("M-Pesa payments are not configured".to_string()))
}

fn view(attempt: &PaymentAttempt) -> PaymentStatusView {
    PaymentStatusView::new(attempt, attempt.seconds_remaining(Utc::now()))
}

pub async fn initiate_stk_push(
    State(state): State<AppState>,
    Json(payload): Json<StkPushPayload>,
) -> Result<(StatusCode, Json<PaymentResponse>)> {
    payload.validate()?;
    let service = payments(&state)?;

    info!(order_id = %payload.order_id, amount = payload.amount, "STK push requested");

    let order_reference = payload
        .order_reference
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| payload.order_id.clone());

    let attempt = service
        .initiate(InitiatePayment {
            order_id: payload.order_id,
            order_reference,
            amount: payload.amount,
            phone_number: payload.phone_number,
            description: payload.description,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(PaymentResponse::new(view(&attempt)))))
}

pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<Json<PaymentResponse>> {
    let view = payments(&state)?.status(&transaction_id).await?;
    Ok(Json(PaymentResponse::new(view)))
}

pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
    payload: Option<Json<CancelPayload>>,
) -> Result<Json<PaymentResponse>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate()?;

    let attempt = payments(&state)?
        .cancel(&transaction_id, payload.reason.as_deref())
        .await?;
    Ok(Json(PaymentResponse::new(view(&attempt))))
}

pub async fn retry_payment(
    State(state): State<AppState>,
    Path(transaction_id): Path<String>,
) -> Result<(StatusCode, Json<PaymentResponse>)> {
    let attempt = payments(&state)?.retry(&transaction_id).await?;
    Ok((StatusCode::CREATED, Json(PaymentResponse::new(view(&attempt)))))
}

/// Attempt history reads the ledger directly so it works without a gateway.
pub async fn get_order_payments(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<PaymentHistoryResponse>> {
    let attempts = state.ledger.list_for_order(&order_id).await?;
    Ok(Json(PaymentHistoryResponse {
        success: true,
        order_id,
        attempts,
    }))
}
