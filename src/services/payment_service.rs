// services/payment_service.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::database::ledger::TransactionLedger;
use crate::errors::{AppError, Result};
use crate::models::mpesa::StkCallback;
use crate::models::payment_attempt::{
    Finalization, PaymentAttempt, PaymentStatus, PaymentStatusView, TerminalOutcome,
};
use crate::services::gateway::{PaymentGateway, PushRequest};
use crate::services::mpesa_service::normalize_phone_number;
use crate::services::status_poller::{PollerRegistry, StatusPoller};

#[derive(Debug, Clone)]
pub struct InitiatePayment {
    pub order_id: String,
    pub order_reference: String,
    pub amount: f64,
    pub phone_number: String,
    pub description: Option<String>,
}

/// Push-payment initiation and the lifecycle operations around it.
pub struct PaymentService {
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn TransactionLedger>,
    poller: StatusPoller,
    registry: Arc<PollerRegistry>,
    payment_timeout: chrono::Duration,
}

impl PaymentService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn TransactionLedger>,
        registry: Arc<PollerRegistry>,
        payment_timeout: Duration,
        poll_interval: Duration,
        query_timeout: Duration,
    ) -> Self {
        let poller = StatusPoller::new(gateway.clone(), ledger.clone(), poll_interval, query_timeout);
        PaymentService {
            gateway,
            ledger,
            poller,
            registry,
            payment_timeout: chrono::Duration::from_std(payment_timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    pub fn live_pollers(&self) -> usize {
        self.registry.len()
    }

    /// Sends an STK push for an order and starts watching it.
    ///
    /// Never retried internally: a rejected push leaves no ledger entry and
    /// the caller decides whether to try again.
    pub async fn initiate(&self, request: InitiatePayment) -> Result<PaymentAttempt> {
        if !request.amount.is_finite() || request.amount <= 0.0 {
            return Err(AppError::invalid_data("Amount must be greater than 0"));
        }
        // Daraja charges whole shillings only.
        if request.amount.fract() != 0.0 {
            return Err(AppError::invalid_data("Amount must be a whole number of shillings"));
        }
        if request.order_id.trim().is_empty() {
            return Err(AppError::invalid_data("order_id is required"));
        }
        let phone_number = normalize_phone_number(&request.phone_number)?;

        self.release_stale_attempt(&request.order_id).await?;

        let attempt = PaymentAttempt::reserve(
            &request.order_id,
            &request.order_reference,
            request.amount,
            &phone_number,
            Utc::now(),
            self.payment_timeout,
        );
        self.ledger.reserve(&attempt).await?;

        let push = PushRequest {
            amount: request.amount,
            phone_number,
            account_reference: request.order_reference.clone(),
            description: request
                .description
                .clone()
                .unwrap_or_else(|| format!("Payment for {}", request.order_reference)),
        };

        // Detached: the reservation is activated or discarded even if the
        // caller stops waiting.
        let transaction_id = attempt.transaction_id.clone();
        tokio::spawn(complete_push(
            self.gateway.clone(),
            self.ledger.clone(),
            self.poller.clone(),
            self.registry.clone(),
            attempt,
            push,
        ))
        .await
        .map_err(|e| AppError::service(format!("push task for {} failed: {}", transaction_id, e)))?
    }

    /// An unsettled attempt past its deadline with no poller behind it (the
    /// process restarted, or the push never finished) is expired so the order
    /// can be paid again.
    async fn release_stale_attempt(&self, order_id: &str) -> Result<()> {
        if let Some(active) = self.ledger.find_active_for_order(order_id).await? {
            if self.is_stale(&active) {
                info!(
                    transaction_id = %active.transaction_id,
                    status = %active.status,
                    "Expiring stale attempt before new push"
                );
                self.ledger
                    .finalize(&active.transaction_id, &TerminalOutcome::expired())
                    .await?;
            }
        }
        Ok(())
    }

    fn is_stale(&self, attempt: &PaymentAttempt) -> bool {
        !attempt.is_terminal()
            && attempt.is_expired_at(Utc::now())
            && !self.registry.is_tracking(&attempt.transaction_id)
    }

    /// Starts the poller for a pending attempt unless one is already running.
    pub fn watch(&self, attempt: PaymentAttempt) {
        watch(&self.poller, &self.registry, attempt);
    }

    /// New attempt for the same order, amount and payer.
    pub async fn retry(&self, transaction_id: &str) -> Result<PaymentAttempt> {
        let previous = self.get(transaction_id).await?;
        if !previous.can_retry() {
            return Err(AppError::RetryNotAllowed(transaction_id.to_string()));
        }
        info!(order_id = %previous.order_id, previous = %transaction_id, "Retrying payment");
        self.initiate(InitiatePayment {
            order_id: previous.order_id,
            order_reference: previous.order_reference,
            amount: previous.amount,
            phone_number: previous.payer_address,
            description: None,
        })
        .await
    }

    pub async fn get(&self, transaction_id: &str) -> Result<PaymentAttempt> {
        self.ledger
            .get(transaction_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("payment {}", transaction_id)))
    }

    pub async fn status(&self, transaction_id: &str) -> Result<PaymentStatusView> {
        let mut attempt = self.get(transaction_id).await?;
        let now = Utc::now();

        if self.is_stale(&attempt) {
            attempt = self
                .ledger
                .finalize(transaction_id, &TerminalOutcome::expired())
                .await?
                .into_attempt();
        }

        let remaining = match self.registry.remaining_secs(transaction_id) {
            Some(secs) if !attempt.is_terminal() => secs,
            _ => attempt.seconds_remaining(now),
        };
        Ok(PaymentStatusView::new(&attempt, remaining))
    }

    /// Operator cancel. The gateway is asked to cancel when it supports it,
    /// but the local record moves to `cancelled` whatever it answers.
    pub async fn cancel(&self, transaction_id: &str, reason: Option<&str>) -> Result<PaymentAttempt> {
        let attempt = self.get(transaction_id).await?;
        if attempt.is_terminal() {
            return Ok(attempt);
        }
        if attempt.is_expired_at(Utc::now()) {
            self.registry.cancel(transaction_id);
            self.ledger
                .finalize(transaction_id, &TerminalOutcome::expired())
                .await?;
            return Err(AppError::ExpiredAttempt);
        }

        self.registry.cancel(transaction_id);

        if let Some(checkout_request_id) = &attempt.gateway_request_id {
            match self.gateway.cancel(checkout_request_id).await {
                Ok(true) => info!(transaction_id = %transaction_id, "Gateway cancelled the push"),
                Ok(false) => info!(transaction_id = %transaction_id, "Gateway has no cancel; cancelling locally"),
                Err(e) => warn!(transaction_id = %transaction_id, "Gateway cancel failed: {}", e),
            }
        }

        let finalization = self
            .ledger
            .finalize(transaction_id, &TerminalOutcome::cancelled(reason))
            .await?;
        if finalization.was_applied() {
            info!(transaction_id = %transaction_id, "Payment cancelled by operator");
        }
        Ok(finalization.into_attempt())
    }

    /// Applies an authenticated STK callback. Returns `None` when no attempt
    /// carries the callback's checkout request id.
    pub async fn apply_callback(&self, callback: &StkCallback) -> Result<Option<Finalization>> {
        let Some(attempt) = self
            .ledger
            .find_by_checkout_id(&callback.checkout_request_id)
            .await?
        else {
            warn!(
                checkout_request_id = %callback.checkout_request_id,
                "Callback for unknown checkout request"
            );
            return Ok(None);
        };

        if let Some(paid) = callback.amount() {
            if (paid - attempt.amount).abs() >= 0.01 {
                warn!(
                    transaction_id = %attempt.transaction_id,
                    expected = attempt.amount,
                    paid,
                    "Callback amount differs from the requested amount"
                );
            }
        }

        let outcome = TerminalOutcome::from_result_code(
            callback.result_code,
            &callback.result_desc,
            callback.receipt_number(),
        );
        let finalization = self.ledger.finalize(&attempt.transaction_id, &outcome).await?;

        if finalization.was_applied() {
            info!(
                transaction_id = %attempt.transaction_id,
                merchant_request_id = %callback.merchant_request_id,
                result_code = callback.result_code,
                receipt = ?callback.receipt_number(),
                "Callback settled payment"
            );
            self.registry.cancel(&attempt.transaction_id);
        } else {
            info!(
                transaction_id = %attempt.transaction_id,
                status = %finalization.attempt().status,
                "Callback for already settled payment ignored"
            );
        }
        Ok(Some(finalization))
    }

    /// Restarts pollers for attempts left pending by a previous process.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.ledger.list_pending().await?;
        let count = pending.len();
        for attempt in pending {
            self.watch(attempt);
        }
        if count > 0 {
            info!("Resumed polling for {} pending payments", count);
        }
        Ok(count)
    }
}

fn watch(poller: &StatusPoller, registry: &Arc<PollerRegistry>, attempt: PaymentAttempt) {
    if attempt.status != PaymentStatus::Pending || registry.is_tracking(&attempt.transaction_id) {
        return;
    }
    registry.track(poller.spawn(attempt));
}

/// Push, then `initiating` -> `pending` and a poller, or drop the reservation
/// when the gateway refuses.
async fn complete_push(
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn TransactionLedger>,
    poller: StatusPoller,
    registry: Arc<PollerRegistry>,
    attempt: PaymentAttempt,
    push: PushRequest,
) -> Result<PaymentAttempt> {
    let accepted = match gateway.push(&push).await {
        Ok(accepted) => accepted,
        Err(err) => {
            if let Err(discard_err) = ledger.discard(&attempt.transaction_id).await {
                error!(
                    transaction_id = %attempt.transaction_id,
                    "Failed to discard rejected reservation: {}", discard_err
                );
            }
            warn!(order_id = %attempt.order_id, "STK push not accepted: {}", err);
            return Err(err);
        }
    };

    let activated = ledger
        .activate(
            &attempt.transaction_id,
            &accepted.checkout_request_id,
            &accepted.merchant_request_id,
        )
        .await;
    let activated = match activated {
        Ok(activated) => activated,
        Err(e) => {
            // The reservation expires once its deadline passes.
            error!(
                transaction_id = %attempt.transaction_id,
                checkout_request_id = %accepted.checkout_request_id,
                "Push accepted but the attempt could not be activated: {}", e
            );
            return Err(e);
        }
    };

    info!(
        transaction_id = %activated.transaction_id,
        order_id = %activated.order_id,
        checkout_request_id = %accepted.checkout_request_id,
        customer_message = %accepted.customer_message,
        "Payment pending until {}", activated.expires_at
    );

    watch(&poller, &registry, activated.clone());
    Ok(activated)
}
