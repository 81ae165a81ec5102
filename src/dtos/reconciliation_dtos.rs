use chrono::{DateTime, Utc};
use serde::Deserialize;
use validator::Validate;

use crate::models::reconciliation::GatewayTransaction;

#[derive(Debug, Deserialize, Validate)]
pub struct ReconcilePayload {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    #[validate(range(min = 0.0, message = "actual_cash must be zero or more"))]
    pub actual_cash: f64,

    #[validate(length(max = 1000, message = "Notes are too long"))]
    pub notes: Option<String>,

    pub reconciled_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MatchPayload {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,

    #[validate(length(max = 10000, message = "Too many gateway transactions"))]
    #[serde(default)]
    pub gateway_transactions: Vec<GatewayTransaction>,
}
