// models/reconciliation.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    /// Period opened but no drawer count entered yet. `reconcile` always
    /// closes the period, so only records written by other tools carry it.
    Pending,
    Reconciled,
    VariancePending,
}

/// Closed-period cash count. Never edited once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub id: String,
    pub shop_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub expected_cash: f64,
    pub actual_cash: f64,
    pub variance: f64,
    pub variance_percentage: f64,
    pub status: ReconciliationStatus,
    pub notes: Option<String>,
    pub reconciled_by: Option<String>,
    pub reconciled_at: DateTime<Utc>,
    /// Totals per non-cash method, reported alongside the cash variance.
    #[serde(default)]
    pub method_breakdown: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Mpesa,
    Card,
    BankTransfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Mpesa => "mpesa",
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayment {
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(default)]
    pub mpesa_receipt_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Completed,
    Cancelled,
    Refunded,
}

/// Read model of an order owned by the checkout side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub shop_id: String,
    pub order_number: String,
    pub total: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub payments: Vec<OrderPayment>,
}

/// One row from the gateway's own transaction export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub receipt_number: String,
    pub amount: f64,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub transaction_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Order claims an electronic payment the gateway has no record of.
    OrderWithoutGatewayRecord,
    /// Gateway received money that no order accounts for.
    GatewayWithoutOrder,
    /// Receipt already settled an earlier payment in the same run.
    DuplicateReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub order_id: Option<String>,
    pub order_number: Option<String>,
    pub receipt_number: Option<String>,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchReport {
    pub shop_id: String,
    pub matched: usize,
    pub unmatched: usize,
    /// Gateway rows no order accounts for.
    pub gateway_unmatched: usize,
    pub matched_amount: f64,
    pub unmatched_amount: f64,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VarianceSummary {
    pub shop_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_expected: f64,
    pub total_actual: f64,
    pub total_variance: f64,
    pub needs_review: usize,
    pub records: Vec<ReconciliationRecord>,
}
