// database/mongo_ledger.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{self, doc, oid::ObjectId, Document},
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument},
    Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};

use crate::database::ledger::TransactionLedger;
use crate::errors::{AppError, Result};
use crate::models::payment_attempt::{Finalization, PaymentAttempt, PaymentStatus, TerminalOutcome};

const COLLECTION: &str = "payment_attempts";
const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptDocument {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    id: Option<ObjectId>,
    transaction_id: String,
    order_id: String,
    order_reference: String,
    amount: f64,
    payer_address: String,
    gateway_request_id: Option<String>,
    merchant_request_id: Option<String>,
    gateway_confirmation_id: Option<String>,
    status: PaymentStatus,
    /// True while initiating/pending; backs the one-active-attempt index.
    active: bool,
    result_code: Option<i32>,
    result_message: Option<String>,
    created_at: bson::DateTime,
    expires_at: bson::DateTime,
    completed_at: Option<bson::DateTime>,
}

impl From<&PaymentAttempt> for AttemptDocument {
    fn from(attempt: &PaymentAttempt) -> Self {
        AttemptDocument {
            id: None,
            transaction_id: attempt.transaction_id.clone(),
            order_id: attempt.order_id.clone(),
            order_reference: attempt.order_reference.clone(),
            amount: attempt.amount,
            payer_address: attempt.payer_address.clone(),
            gateway_request_id: attempt.gateway_request_id.clone(),
            merchant_request_id: attempt.merchant_request_id.clone(),
            gateway_confirmation_id: attempt.gateway_confirmation_id.clone(),
            status: attempt.status,
            active: !attempt.is_terminal(),
            result_code: attempt.result_code,
            result_message: attempt.result_message.clone(),
            created_at: bson::DateTime::from_chrono(attempt.created_at),
            expires_at: bson::DateTime::from_chrono(attempt.expires_at),
            completed_at: attempt.completed_at.map(bson::DateTime::from_chrono),
        }
    }
}

impl From<AttemptDocument> for PaymentAttempt {
    fn from(doc: AttemptDocument) -> Self {
        PaymentAttempt {
            transaction_id: doc.transaction_id,
            order_id: doc.order_id,
            order_reference: doc.order_reference,
            amount: doc.amount,
            payer_address: doc.payer_address,
            gateway_request_id: doc.gateway_request_id,
            merchant_request_id: doc.merchant_request_id,
            gateway_confirmation_id: doc.gateway_confirmation_id,
            status: doc.status,
            result_code: doc.result_code,
            result_message: doc.result_message,
            created_at: doc.created_at.to_chrono(),
            expires_at: doc.expires_at.to_chrono(),
            completed_at: doc.completed_at.map(|d| d.to_chrono()),
        }
    }
}

pub struct MongoLedger {
    collection: Collection<AttemptDocument>,
}

impl MongoLedger {
    pub fn new(db: &Database) -> Self {
        MongoLedger {
            collection: db.collection(COLLECTION),
        }
    }

    /// Creates the indexes the ledger invariants rely on. Idempotent.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let by_transaction = IndexModel::builder()
            .keys(doc! { "transaction_id": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();

        let by_checkout = IndexModel::builder()
            .keys(doc! { "gateway_request_id": 1 })
            .build();

        self.collection
            .create_indexes([by_transaction, one_active_attempt_index(), by_checkout])
            .await?;
        tracing::info!("Ledger indexes ensured on '{}'", COLLECTION);
        Ok(())
    }

    async fn find_many(&self, filter: Document) -> Result<Vec<PaymentAttempt>> {
        let cursor = self.collection.find(filter).sort(doc! { "created_at": -1 }).await?;
        let docs: Vec<AttemptDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(PaymentAttempt::from).collect())
    }
}

/// Unique over `order_id` among documents with `active: true`, so a second
/// reservation for a busy order fails with a duplicate key.
fn one_active_attempt_index() -> IndexModel {
    IndexModel::builder()
        .keys(doc! { "order_id": 1 })
        .options(
            IndexOptions::builder()
                .name("one_active_attempt_per_order".to_string())
                .unique(true)
                .partial_filter_expression(doc! { "active": true })
                .build(),
        )
        .build()
}

/// The status predicate is the compare-and-swap. Expiry may also take an
/// `initiating` reservation whose deadline has passed.
fn finalize_filter(transaction_id: &str, outcome: &TerminalOutcome, now: DateTime<Utc>) -> Document {
    if outcome.status == PaymentStatus::Expired {
        doc! {
            "transaction_id": transaction_id,
            "$or": [
                { "status": PaymentStatus::Pending.as_str() },
                {
                    "status": PaymentStatus::Initiating.as_str(),
                    "expires_at": { "$lt": bson::DateTime::from_chrono(now) },
                },
            ],
        }
    } else {
        doc! {
            "transaction_id": transaction_id,
            "status": PaymentStatus::Pending.as_str(),
        }
    }
}

fn finalize_update(outcome: &TerminalOutcome, now: DateTime<Utc>) -> Document {
    let mut set = doc! {
        "status": outcome.status.as_str(),
        "active": false,
        "result_message": outcome.result_message.as_str(),
        "completed_at": bson::DateTime::from_chrono(now),
    };
    if let Some(code) = outcome.result_code {
        set.insert("result_code", code);
    }
    if let Some(receipt) = &outcome.confirmation_id {
        set.insert("gateway_confirmation_id", receipt.as_str());
    }
    doc! { "$set": set }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl TransactionLedger for MongoLedger {
    fn backend(&self) -> &'static str {
        "mongo"
    }

    async fn reserve(&self, attempt: &PaymentAttempt) -> Result<()> {
        match self.collection.insert_one(AttemptDocument::from(attempt)).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => {
                Err(AppError::PendingAttemptExists(attempt.order_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn activate(
        &self,
        transaction_id: &str,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<PaymentAttempt> {
        let filter = doc! {
            "transaction_id": transaction_id,
            "status": PaymentStatus::Initiating.as_str(),
        };
        let update = doc! {
            "$set": {
                "status": PaymentStatus::Pending.as_str(),
                "gateway_request_id": checkout_request_id,
                "merchant_request_id": merchant_request_id,
            }
        };

        self.collection
            .find_one_and_update(filter, update)
            .return_document(ReturnDocument::After)
            .await?
            .map(PaymentAttempt::from)
            .ok_or_else(|| AppError::service(format!("payment {} is not initiating", transaction_id)))
    }

    async fn discard(&self, transaction_id: &str) -> Result<()> {
        self.collection
            .delete_one(doc! {
                "transaction_id": transaction_id,
                "status": PaymentStatus::Initiating.as_str(),
            })
            .await?;
        Ok(())
    }

    async fn get(&self, transaction_id: &str) -> Result<Option<PaymentAttempt>> {
        let found = self
            .collection
            .find_one(doc! { "transaction_id": transaction_id })
            .await?;
        Ok(found.map(PaymentAttempt::from))
    }

    async fn find_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<PaymentAttempt>> {
        let found = self
            .collection
            .find_one(doc! { "gateway_request_id": checkout_request_id })
            .await?;
        Ok(found.map(PaymentAttempt::from))
    }

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<PaymentAttempt>> {
        let found = self
            .collection
            .find_one(doc! { "order_id": order_id, "active": true })
            .await?;
        Ok(found.map(PaymentAttempt::from))
    }

    async fn list_for_order(&self, order_id: &str) -> Result<Vec<PaymentAttempt>> {
        self.find_many(doc! { "order_id": order_id }).await
    }

    async fn list_pending(&self) -> Result<Vec<PaymentAttempt>> {
        self.find_many(doc! { "status": PaymentStatus::Pending.as_str() }).await
    }

    async fn finalize(&self, transaction_id: &str, outcome: &TerminalOutcome) -> Result<Finalization> {
        let now = Utc::now();
        let updated = self
            .collection
            .find_one_and_update(
                finalize_filter(transaction_id, outcome, now),
                finalize_update(outcome, now),
            )
            .return_document(ReturnDocument::After)
            .await?;

        match updated {
            Some(doc) => Ok(Finalization::Applied(doc.into())),
            None => self
                .get(transaction_id)
                .await?
                .map(Finalization::Unchanged)
                .ok_or_else(|| AppError::not_found(format!("payment {}", transaction_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_round_trip_keeps_active_flag_and_times() {
        let mut attempt = PaymentAttempt::reserve(
            "order-1",
            "INV-1",
            99.0,
            "254712345678",
            Utc::now(),
            chrono::Duration::minutes(5),
        );
        attempt.activate("ws_CO_1", "mr-1");

        let doc = AttemptDocument::from(&attempt);
        assert!(doc.active);

        let stored = bson::to_document(&doc).unwrap();
        assert_eq!(stored.get_str("status").unwrap(), "pending");
        assert!(stored.get_datetime("expires_at").is_ok());

        let back = PaymentAttempt::from(doc);
        // bson dates are millisecond precision
        assert_eq!(back.expires_at.timestamp_millis(), attempt.expires_at.timestamp_millis());
        assert_eq!(back.gateway_request_id.as_deref(), Some("ws_CO_1"));
    }

    #[test]
    fn finalize_only_matches_pending_attempts() {
        let outcome = TerminalOutcome::from_result_code(0, "Processed", Some("NLJ7RT61SV".into()));
        let filter = finalize_filter("tx-1", &outcome, Utc::now());
        assert_eq!(filter.get_str("transaction_id").unwrap(), "tx-1");
        assert_eq!(filter.get_str("status").unwrap(), "pending");
        assert!(filter.get("$or").is_none());

        let update = finalize_update(&outcome, Utc::now());
        let set = update.get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "completed");
        assert!(!set.get_bool("active").unwrap());
        assert_eq!(set.get_i32("result_code").unwrap(), 0);
        assert_eq!(set.get_str("gateway_confirmation_id").unwrap(), "NLJ7RT61SV");
    }

    #[test]
    fn expiry_also_matches_overdue_reservations() {
        let now = Utc::now();
        let filter = finalize_filter("tx-1", &TerminalOutcome::expired(), now);
        assert!(filter.get("status").is_none());

        let branches = filter.get_array("$or").unwrap();
        assert_eq!(branches.len(), 2);
        let pending = branches[0].as_document().unwrap();
        assert_eq!(pending.get_str("status").unwrap(), "pending");
        let initiating = branches[1].as_document().unwrap();
        assert_eq!(initiating.get_str("status").unwrap(), "initiating");
        let deadline = initiating.get_document("expires_at").unwrap();
        assert_eq!(deadline.get_datetime("$lt").unwrap(), &bson::DateTime::from_chrono(now));

        let update = finalize_update(&TerminalOutcome::expired(), now);
        let set = update.get_document("$set").unwrap();
        assert!(set.get("result_code").is_none());
        assert!(set.get("gateway_confirmation_id").is_none());
    }

    #[test]
    fn one_active_attempt_index_is_partial_and_unique() {
        let index = one_active_attempt_index();
        assert_eq!(index.keys, doc! { "order_id": 1 });
        let options = index.options.unwrap();
        assert_eq!(options.unique, Some(true));
        assert_eq!(options.partial_filter_expression, Some(doc! { "active": true }));
    }
}
