// database/reconciliation_store.rs
use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, oid::ObjectId},
    Collection, Database,
};
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};
use crate::models::reconciliation::{
    OrderPayment, OrderRecord, OrderStatus, ReconciliationRecord, ReconciliationStatus,
};

/// Read side of the order store plus the append-only reconciliation log.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Completed orders of a shop created within `[start, end]`.
    async fn completed_orders(
        &self,
        shop_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>>;

    async fn append(&self, record: &ReconciliationRecord) -> Result<()>;

    /// Records whose period overlaps `[from, to]`, oldest first.
    async fn records_overlapping(
        &self,
        shop_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationRecord>>;
}

#[derive(Default)]
pub struct InMemoryReconciliationStore {
    orders: RwLock<Vec<OrderRecord>>,
    records: RwLock<Vec<ReconciliationRecord>>,
}

impl InMemoryReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Orders are written by checkout; this stands in for it in tests.
    #[cfg(test)]
    pub fn insert_order(&self, order: OrderRecord) -> Result<()> {
        self.orders
            .write()
            .map_err(|_| AppError::service("order store lock poisoned"))?
            .push(order);
        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryReconciliationStore {
    async fn completed_orders(
        &self,
        shop_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>> {
        let orders = self
            .orders
            .read()
            .map_err(|_| AppError::service("order store lock poisoned"))?;
        Ok(orders
            .iter()
            .filter(|o| {
                o.shop_id == shop_id
                    && o.status == OrderStatus::Completed
                    && o.created_at >= start
                    && o.created_at <= end
            })
            .cloned()
            .collect())
    }

    async fn append(&self, record: &ReconciliationRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| AppError::service("reconciliation lock poisoned"))?
            .push(record.clone());
        Ok(())
    }

    async fn records_overlapping(
        &self,
        shop_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| AppError::service("reconciliation lock poisoned"))?;
        let mut found: Vec<ReconciliationRecord> = records
            .iter()
            .filter(|r| r.shop_id == shop_id && r.period_start <= to && r.period_end >= from)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.period_start.cmp(&b.period_start));
        Ok(found)
    }
}

// Mongo layout of the orders collection written by checkout.
#[derive(Debug, Deserialize)]
struct OrderDocument {
    order_id: String,
    shop_id: String,
    order_number: String,
    total: f64,
    status: OrderStatus,
    created_at: bson::DateTime,
    #[serde(default)]
    payments: Vec<OrderPayment>,
}

impl From<OrderDocument> for OrderRecord {
    fn from(doc: OrderDocument) -> Self {
        OrderRecord {
            order_id: doc.order_id,
            shop_id: doc.shop_id,
            order_number: doc.order_number,
            total: doc.total,
            status: doc.status,
            created_at: doc.created_at.to_chrono(),
            payments: doc.payments,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    record_id: String,
    shop_id: String,
    period_start: bson::DateTime,
    period_end: bson::DateTime,
    expected_cash: f64,
    actual_cash: f64,
    variance: f64,
    variance_percentage: f64,
    status: ReconciliationStatus,
    notes: Option<String>,
    reconciled_by: Option<String>,
    reconciled_at: bson::DateTime,
    #[serde(default)]
    method_breakdown: BTreeMap<String, f64>,
}

impl From<&ReconciliationRecord> for RecordDocument {
    fn from(record: &ReconciliationRecord) -> Self {
        RecordDocument {
            id: None,
            record_id: record.id.clone(),
            shop_id: record.shop_id.clone(),
            period_start: bson::DateTime::from_chrono(record.period_start),
            period_end: bson::DateTime::from_chrono(record.period_end),
            expected_cash: record.expected_cash,
            actual_cash: record.actual_cash,
            variance: record.variance,
            variance_percentage: record.variance_percentage,
            status: record.status,
            notes: record.notes.clone(),
            reconciled_by: record.reconciled_by.clone(),
            reconciled_at: bson::DateTime::from_chrono(record.reconciled_at),
            method_breakdown: record.method_breakdown.clone(),
        }
    }
}

impl From<RecordDocument> for ReconciliationRecord {
    fn from(doc: RecordDocument) -> Self {
        ReconciliationRecord {
            id: doc.record_id,
            shop_id: doc.shop_id,
            period_start: doc.period_start.to_chrono(),
            period_end: doc.period_end.to_chrono(),
            expected_cash: doc.expected_cash,
            actual_cash: doc.actual_cash,
            variance: doc.variance,
            variance_percentage: doc.variance_percentage,
            status: doc.status,
            notes: doc.notes,
            reconciled_by: doc.reconciled_by,
            reconciled_at: doc.reconciled_at.to_chrono(),
            method_breakdown: doc.method_breakdown,
        }
    }
}

pub struct MongoReconciliationStore {
    orders: Collection<OrderDocument>,
    records: Collection<RecordDocument>,
}

impl MongoReconciliationStore {
    pub fn new(db: &Database) -> Self {
        MongoReconciliationStore {
            orders: db.collection("orders"),
            records: db.collection("reconciliations"),
        }
    }
}

#[async_trait]
impl ReconciliationStore for MongoReconciliationStore {
    async fn completed_orders(
        &self,
        shop_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OrderRecord>> {
        let filter = doc! {
            "shop_id": shop_id,
            "status": "completed",
            "created_at": {
                "$gte": bson::DateTime::from_chrono(start),
                "$lte": bson::DateTime::from_chrono(end),
            },
        };
        let cursor = self.orders.find(filter).await?;
        let docs: Vec<OrderDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(OrderRecord::from).collect())
    }

    async fn append(&self, record: &ReconciliationRecord) -> Result<()> {
        self.records.insert_one(RecordDocument::from(record)).await?;
        Ok(())
    }

    async fn records_overlapping(
        &self,
        shop_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ReconciliationRecord>> {
        let filter = doc! {
            "shop_id": shop_id,
            "period_start": { "$lte": bson::DateTime::from_chrono(to) },
            "period_end": { "$gte": bson::DateTime::from_chrono(from) },
        };
        let cursor = self.records.find(filter).sort(doc! { "period_start": 1 }).await?;
        let docs: Vec<RecordDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(ReconciliationRecord::from).collect())
    }
}
