// services/reconciliation_service.rs
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::reconciliation_store::ReconciliationStore;
use crate::errors::{AppError, Result};
use crate::models::reconciliation::{
    Discrepancy, DiscrepancyKind, GatewayTransaction, MatchReport, OrderRecord, PaymentMethod,
    ReconciliationRecord, ReconciliationStatus, VarianceSummary,
};

pub const DEFAULT_TOLERANCE_PERCENT: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct ReconcileInput {
    pub shop_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub actual_cash: f64,
    pub notes: Option<String>,
    pub reconciled_by: Option<String>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Cash the drawer should hold: cash-method payments on the given orders.
pub fn expected_cash(orders: &[OrderRecord]) -> f64 {
    round2(
        orders
            .iter()
            .flat_map(|o| o.payments.iter())
            .filter(|p| p.method == PaymentMethod::Cash)
            .map(|p| p.amount)
            .sum(),
    )
}

/// Totals for every non-cash method seen on the orders.
pub fn method_breakdown(orders: &[OrderRecord]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for payment in orders.iter().flat_map(|o| o.payments.iter()) {
        if payment.method != PaymentMethod::Cash {
            *totals.entry(payment.method.as_str().to_string()).or_insert(0.0) += payment.amount;
        }
    }
    totals.values_mut().for_each(|v| *v = round2(*v));
    totals
}

/// `(variance, variance_percentage)`. The percentage is 0 when nothing was expected.
pub fn compute_variance(expected: f64, actual: f64) -> (f64, f64) {
    let variance = round2(actual - expected);
    let percentage = if expected == 0.0 {
        0.0
    } else {
        round2(variance * 100.0 / expected)
    };
    (variance, percentage)
}

pub fn classify(variance_percentage: f64, tolerance_percent: f64) -> ReconciliationStatus {
    if variance_percentage.abs() <= tolerance_percent {
        ReconciliationStatus::Reconciled
    } else {
        ReconciliationStatus::VariancePending
    }
}

fn receipt_key(receipt: &str) -> String {
    receipt.trim().to_uppercase()
}

/// Joins order payments with the gateway export on receipt number.
///
/// Only electronic payments take part: M-Pesa payments, and any payment that
/// carries a receipt. Cash-only orders are left out of the join. A receipt
/// settles one payment; later payments quoting it are duplicates.
pub fn match_transactions(
    shop_id: &str,
    orders: &[OrderRecord],
    gateway_transactions: &[GatewayTransaction],
) -> MatchReport {
    let gateway: HashMap<String, &GatewayTransaction> = gateway_transactions
        .iter()
        .filter(|t| !t.receipt_number.trim().is_empty())
        .map(|t| (receipt_key(&t.receipt_number), t))
        .collect();

    let mut claimed: HashSet<String> = HashSet::new();
    let mut report = MatchReport {
        shop_id: shop_id.to_string(),
        matched: 0,
        unmatched: 0,
        gateway_unmatched: 0,
        matched_amount: 0.0,
        unmatched_amount: 0.0,
        discrepancies: Vec::new(),
    };

    for order in orders {
        for payment in &order.payments {
            let receipt = payment
                .mpesa_receipt_number
                .as_deref()
                .map(receipt_key)
                .filter(|r| !r.is_empty());
            if payment.method != PaymentMethod::Mpesa && receipt.is_none() {
                continue;
            }

            let kind = match receipt.filter(|r| gateway.contains_key(r)) {
                Some(receipt) if claimed.insert(receipt.clone()) => {
                    report.matched += 1;
                    report.matched_amount += payment.amount;
                    continue;
                }
                Some(_) => DiscrepancyKind::DuplicateReceipt,
                None => DiscrepancyKind::OrderWithoutGatewayRecord,
            };

            report.unmatched += 1;
            report.unmatched_amount += payment.amount;
            report.discrepancies.push(Discrepancy {
                kind,
                order_id: Some(order.order_id.clone()),
                order_number: Some(order.order_number.clone()),
                receipt_number: payment.mpesa_receipt_number.clone(),
                amount: payment.amount,
            });
        }
    }

    for transaction in gateway_transactions {
        let key = receipt_key(&transaction.receipt_number);
        if key.is_empty() || claimed.contains(&key) {
            continue;
        }
        // Duplicated export rows are reported once.
        claimed.insert(key);
        report.gateway_unmatched += 1;
        report.discrepancies.push(Discrepancy {
            kind: DiscrepancyKind::GatewayWithoutOrder,
            order_id: None,
            order_number: None,
            receipt_number: Some(transaction.receipt_number.clone()),
            amount: transaction.amount,
        });
    }

    report.matched_amount = round2(report.matched_amount);
    report.unmatched_amount = round2(report.unmatched_amount);
    report
}

fn check_period(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end < start {
        return Err(AppError::invalid_data("period_end must not be before period_start"));
    }
    Ok(())
}

pub struct ReconciliationService {
    store: Arc<dyn ReconciliationStore>,
    tolerance_percent: f64,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn ReconciliationStore>, tolerance_percent: f64) -> Self {
        ReconciliationService {
            store,
            tolerance_percent,
        }
    }

    /// Closes a period: counts expected cash, compares it with the drawer and
    /// appends the record.
    pub async fn reconcile(&self, input: ReconcileInput) -> Result<ReconciliationRecord> {
        check_period(input.period_start, input.period_end)?;
        if !input.actual_cash.is_finite() || input.actual_cash < 0.0 {
            return Err(AppError::invalid_data("actual_cash must be zero or more"));
        }

        let orders = self
            .store
            .completed_orders(&input.shop_id, input.period_start, input.period_end)
            .await?;

        let expected = expected_cash(&orders);
        let actual = round2(input.actual_cash);
        let (variance, variance_percentage) = compute_variance(expected, actual);
        let status = classify(variance_percentage, self.tolerance_percent);

        let record = ReconciliationRecord {
            id: Uuid::new_v4().to_string(),
            shop_id: input.shop_id,
            period_start: input.period_start,
            period_end: input.period_end,
            expected_cash: expected,
            actual_cash: actual,
            variance,
            variance_percentage,
            status,
            notes: input.notes,
            reconciled_by: input.reconciled_by,
            reconciled_at: Utc::now(),
            method_breakdown: method_breakdown(&orders),
        };

        self.store.append(&record).await?;

        if status == ReconciliationStatus::VariancePending {
            warn!(
                shop_id = %record.shop_id,
                variance = record.variance,
                variance_percentage = record.variance_percentage,
                "Cash variance outside tolerance"
            );
        } else {
            info!(shop_id = %record.shop_id, orders = orders.len(), "Period reconciled");
        }
        Ok(record)
    }

    /// Matches the period's completed orders against a gateway export.
    pub async fn match_period(
        &self,
        shop_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        gateway_transactions: &[GatewayTransaction],
    ) -> Result<MatchReport> {
        check_period(period_start, period_end)?;
        let orders = self
            .store
            .completed_orders(shop_id, period_start, period_end)
            .await?;
        let report = match_transactions(shop_id, &orders, gateway_transactions);
        info!(
            shop_id = %shop_id,
            matched = report.matched,
            unmatched = report.unmatched,
            gateway_unmatched = report.gateway_unmatched,
            "Matched gateway transactions"
        );
        Ok(report)
    }

    pub async fn variance_summary(
        &self,
        shop_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<VarianceSummary> {
        check_period(from, to)?;
        let records = self.store.records_overlapping(shop_id, from, to).await?;

        let total_expected = round2(records.iter().map(|r| r.expected_cash).sum());
        let total_actual = round2(records.iter().map(|r| r.actual_cash).sum());
        let needs_review = records
            .iter()
            .filter(|r| r.status != ReconciliationStatus::Reconciled)
            .count();

        Ok(VarianceSummary {
            shop_id: shop_id.to_string(),
            from,
            to,
            total_expected,
            total_actual,
            total_variance: round2(total_actual - total_expected),
            needs_review,
            records,
        })
    }
}
