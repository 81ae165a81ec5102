// database/ledger.rs
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::{AppError, Result};
use crate::models::payment_attempt::{Finalization, PaymentAttempt, PaymentStatus, TerminalOutcome};

/// Persistent record of every payment attempt.
///
/// `finalize` is the only way to reach a terminal state and must behave as a
/// compare-and-swap on `status == pending`: the first caller wins, later calls
/// get [`Finalization::Unchanged`] with the stored attempt. The one exception
/// is expiry, which also settles an `initiating` reservation past its
/// deadline (see [`PaymentAttempt::accepts`]).
#[async_trait]
pub trait TransactionLedger: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Stores an `initiating` attempt. Fails with `PendingAttemptExists` if the
    /// order already has an attempt that is not terminal.
    async fn reserve(&self, attempt: &PaymentAttempt) -> Result<()>;

    /// `initiating` -> `pending` once the gateway accepted the push.
    async fn activate(
        &self,
        transaction_id: &str,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<PaymentAttempt>;

    /// Drops an `initiating` reservation after the gateway rejected the push.
    async fn discard(&self, transaction_id: &str) -> Result<()>;

    async fn get(&self, transaction_id: &str) -> Result<Option<PaymentAttempt>>;

    async fn find_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<PaymentAttempt>>;

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<PaymentAttempt>>;

    /// All attempts for an order, newest first.
    async fn list_for_order(&self, order_id: &str) -> Result<Vec<PaymentAttempt>>;

    async fn list_pending(&self) -> Result<Vec<PaymentAttempt>>;

    async fn finalize(&self, transaction_id: &str, outcome: &TerminalOutcome) -> Result<Finalization>;
}

/// Process-local ledger for development (`LEDGER_BACKEND=memory`) and tests.
#[derive(Default)]
pub struct InMemoryLedger {
    attempts: RwLock<HashMap<String, PaymentAttempt>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, PaymentAttempt>>> {
        self.attempts
            .read()
            .map_err(|_| AppError::service("ledger lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, PaymentAttempt>>> {
        self.attempts
            .write()
            .map_err(|_| AppError::service("ledger lock poisoned"))
    }
}

#[async_trait]
impl TransactionLedger for InMemoryLedger {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn reserve(&self, attempt: &PaymentAttempt) -> Result<()> {
        let mut attempts = self.write()?;
        let busy = attempts
            .values()
            .any(|existing| existing.order_id == attempt.order_id && !existing.is_terminal());
        if busy {
            return Err(AppError::PendingAttemptExists(attempt.order_id.clone()));
        }
        attempts.insert(attempt.transaction_id.clone(), attempt.clone());
        Ok(())
    }

    async fn activate(
        &self,
        transaction_id: &str,
        checkout_request_id: &str,
        merchant_request_id: &str,
    ) -> Result<PaymentAttempt> {
        let mut attempts = self.write()?;
        let attempt = attempts
            .get_mut(transaction_id)
            .ok_or_else(|| AppError::not_found(format!("payment {}", transaction_id)))?;
        if !attempt.activate(checkout_request_id, merchant_request_id) {
            return Err(AppError::service(format!(
                "payment {} is {}, expected initiating",
                transaction_id, attempt.status
            )));
        }
        Ok(attempt.clone())
    }

    async fn discard(&self, transaction_id: &str) -> Result<()> {
        let mut attempts = self.write()?;
        if let Some(attempt) = attempts.get(transaction_id) {
            if attempt.status == PaymentStatus::Initiating {
                attempts.remove(transaction_id);
            }
        }
        Ok(())
    }

    async fn get(&self, transaction_id: &str) -> Result<Option<PaymentAttempt>> {
        Ok(self.read()?.get(transaction_id).cloned())
    }

    async fn find_by_checkout_id(&self, checkout_request_id: &str) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .read()?
            .values()
            .find(|a| a.gateway_request_id.as_deref() == Some(checkout_request_id))
            .cloned())
    }

    async fn find_active_for_order(&self, order_id: &str) -> Result<Option<PaymentAttempt>> {
        Ok(self
            .read()?
            .values()
            .find(|a| a.order_id == order_id && !a.is_terminal())
            .cloned())
    }

    async fn list_for_order(&self, order_id: &str) -> Result<Vec<PaymentAttempt>> {
        let mut attempts: Vec<PaymentAttempt> = self
            .read()?
            .values()
            .filter(|a| a.order_id == order_id)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(attempts)
    }

    async fn list_pending(&self) -> Result<Vec<PaymentAttempt>> {
        Ok(self
            .read()?
            .values()
            .filter(|a| a.status == PaymentStatus::Pending)
            .cloned()
            .collect())
    }

    async fn finalize(&self, transaction_id: &str, outcome: &TerminalOutcome) -> Result<Finalization> {
        let mut attempts = self.write()?;
        let attempt = attempts
            .get_mut(transaction_id)
            .ok_or_else(|| AppError::not_found(format!("payment {}", transaction_id)))?;
        if attempt.apply(outcome, Utc::now()) {
            Ok(Finalization::Applied(attempt.clone()))
        } else {
            Ok(Finalization::Unchanged(attempt.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reservation(order_id: &str) -> PaymentAttempt {
        PaymentAttempt::reserve(
            order_id,
            "INV-7",
            250.0,
            "254712345678",
            Utc::now(),
            chrono::Duration::minutes(5),
        )
    }

    #[tokio::test]
    async fn second_reservation_for_busy_order_is_rejected() {
        let ledger = InMemoryLedger::new();
        ledger.reserve(&reservation("order-1")).await.unwrap();

        let err = ledger.reserve(&reservation("order-1")).await.unwrap_err();
        assert!(matches!(err, AppError::PendingAttemptExists(ref id) if id == "order-1"));

        // Other orders are unaffected.
        ledger.reserve(&reservation("order-2")).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_reservations_admit_exactly_one() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.reserve(&reservation("order-9")).await }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn finalize_is_write_once() {
        let ledger = InMemoryLedger::new();
        let attempt = reservation("order-1");
        ledger.reserve(&attempt).await.unwrap();
        ledger.activate(&attempt.transaction_id, "ws_CO_1", "mr-1").await.unwrap();

        let first = ledger
            .finalize(
                &attempt.transaction_id,
                &TerminalOutcome::from_result_code(0, "Processed", Some("ABC123".into())),
            )
            .await
            .unwrap();
        assert!(first.was_applied());

        let second = ledger
            .finalize(&attempt.transaction_id, &TerminalOutcome::expired())
            .await
            .unwrap();
        assert!(!second.was_applied());
        assert_eq!(second.attempt(), first.attempt());
        assert_eq!(second.attempt().status, PaymentStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_attempt_frees_the_order() {
        let ledger = InMemoryLedger::new();
        let attempt = reservation("order-1");
        ledger.reserve(&attempt).await.unwrap();
        ledger.activate(&attempt.transaction_id, "ws_CO_1", "mr-1").await.unwrap();
        ledger
            .finalize(&attempt.transaction_id, &TerminalOutcome::expired())
            .await
            .unwrap();

        let retry = reservation("order-1");
        ledger.reserve(&retry).await.unwrap();
        assert_eq!(ledger.list_for_order("order-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn overdue_reservation_expires_and_frees_the_order() {
        let ledger = InMemoryLedger::new();
        let stuck = PaymentAttempt::reserve(
            "order-1",
            "INV-7",
            250.0,
            "254712345678",
            Utc::now() - chrono::Duration::hours(1),
            chrono::Duration::minutes(5),
        );
        ledger.reserve(&stuck).await.unwrap();

        let expired = ledger
            .finalize(&stuck.transaction_id, &TerminalOutcome::expired())
            .await
            .unwrap();
        assert!(expired.was_applied());
        assert_eq!(expired.attempt().status, PaymentStatus::Expired);

        ledger.reserve(&reservation("order-1")).await.unwrap();
    }

    #[tokio::test]
    async fn discard_only_drops_reservations() {
        let ledger = InMemoryLedger::new();
        let attempt = reservation("order-1");
        ledger.reserve(&attempt).await.unwrap();
        ledger.discard(&attempt.transaction_id).await.unwrap();
        assert!(ledger.get(&attempt.transaction_id).await.unwrap().is_none());

        let kept = reservation("order-2");
        ledger.reserve(&kept).await.unwrap();
        ledger.activate(&kept.transaction_id, "ws_CO_2", "mr-2").await.unwrap();
        ledger.discard(&kept.transaction_id).await.unwrap();
        assert!(ledger.get(&kept.transaction_id).await.unwrap().is_some());
    }
}
