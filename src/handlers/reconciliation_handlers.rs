// handlers/reconciliation_handlers.rs
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use validator::Validate;

use crate::dtos::reconciliation_dtos::{MatchPayload, ReconcilePayload, SummaryQuery};
use crate::errors::Result;
use crate::models::reconciliation::{MatchReport, ReconciliationRecord, VarianceSummary};
use crate::services::reconciliation_service::ReconcileInput;
use crate::state::AppState;

pub async fn reconcile_period(
    State(state): State<AppState>,
    Path(shop_id): Path<String>,
    Json(payload): Json<ReconcilePayload>,
) -> Result<(StatusCode, Json<ReconciliationRecord>)> {
    payload.validate()?;
    let record = state
        .reconciliation
        .reconcile(ReconcileInput {
            shop_id,
            period_start: payload.period_start,
            period_end: payload.period_end,
            actual_cash: payload.actual_cash,
            notes: payload.notes,
            reconciled_by: payload.reconciled_by,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn variance_summary(
    State(state): State<AppState>,
    Path(shop_id): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<VarianceSummary>> {
    let summary = state
        .reconciliation
        .variance_summary(&shop_id, query.from, query.to)
        .await?;
    Ok(Json(summary))
}

pub async fn match_transactions(
    State(state): State<AppState>,
    Path(shop_id): Path<String>,
    Json(payload): Json<MatchPayload>,
) -> Result<Json<MatchReport>> {
    payload.validate()?;
    let report = state
        .reconciliation
        .match_period(
            &shop_id,
            payload.period_start,
            payload.period_end,
            &payload.gateway_transactions,
        )
        .await?;
    Ok(Json(report))
}
