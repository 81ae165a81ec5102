// models/payment_attempt.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result code the gateway uses for a successful payment.
pub const RESULT_CODE_SUCCESS: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Initiating,
    Pending,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Initiating | PaymentStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Initiating => "initiating",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STK push attempt for an order. Retries create a new attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub transaction_id: String,
    pub order_id: String,
    pub order_reference: String,
    pub amount: f64,
    pub payer_address: String,

    // Gateway identifiers
    pub gateway_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub gateway_confirmation_id: Option<String>,

    pub status: PaymentStatus,
    pub result_code: Option<i32>,
    pub result_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentAttempt {
    /// A fresh reservation in `initiating`, before the gateway has been called.
    pub fn reserve(
        order_id: &str,
        order_reference: &str,
        amount: f64,
        payer_address: &str,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Self {
        PaymentAttempt {
            transaction_id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            order_reference: order_reference.to_string(),
            amount,
            payer_address: payer_address.to_string(),
            gateway_request_id: None,
            merchant_request_id: None,
            gateway_confirmation_id: None,
            status: PaymentStatus::Initiating,
            result_code: None,
            result_message: None,
            created_at: now,
            expires_at: now + timeout,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Retry is offered for every terminal state except `completed`.
    pub fn can_retry(&self) -> bool {
        self.is_terminal() && self.status != PaymentStatus::Completed
    }

    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        if self.is_terminal() {
            return 0;
        }
        (self.expires_at - now).num_seconds().max(0)
    }

    /// Moves `initiating` to `pending` once the gateway accepted the push.
    pub fn activate(&mut self, checkout_request_id: &str, merchant_request_id: &str) -> bool {
        if self.status != PaymentStatus::Initiating {
            return false;
        }
        self.status = PaymentStatus::Pending;
        self.gateway_request_id = Some(checkout_request_id.to_string());
        self.merchant_request_id = Some(merchant_request_id.to_string());
        true
    }

    /// Whether `outcome` may be written over the current state. Any terminal
    /// outcome settles a `pending` attempt; an `initiating` reservation can
    /// only expire, once its deadline has passed.
    pub fn accepts(&self, outcome: &TerminalOutcome, now: DateTime<Utc>) -> bool {
        match self.status {
            PaymentStatus::Pending => outcome.status.is_terminal(),
            PaymentStatus::Initiating => {
                outcome.status == PaymentStatus::Expired && self.is_expired_at(now)
            }
            _ => false,
        }
    }

    /// Write-once terminal transition. Returns `false` and leaves the attempt
    /// untouched when [`accepts`](Self::accepts) refuses the outcome.
    pub fn apply(&mut self, outcome: &TerminalOutcome, now: DateTime<Utc>) -> bool {
        if !self.accepts(outcome, now) {
            return false;
        }
        self.status = outcome.status;
        self.result_code = outcome.result_code;
        self.result_message = Some(outcome.result_message.clone());
        if outcome.confirmation_id.is_some() {
            self.gateway_confirmation_id = outcome.confirmation_id.clone();
        }
        self.completed_at = Some(now);
        true
    }
}

/// What the poller, the callback or an operator observed as final.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub status: PaymentStatus,
    pub result_code: Option<i32>,
    pub result_message: String,
    pub confirmation_id: Option<String>,
}

impl TerminalOutcome {
    /// Maps a gateway result code: 0 completes, anything else fails.
    pub fn from_result_code(code: i32, description: &str, receipt: Option<String>) -> Self {
        let status = if code == RESULT_CODE_SUCCESS {
            PaymentStatus::Completed
        } else {
            PaymentStatus::Failed
        };
        TerminalOutcome {
            status,
            result_code: Some(code),
            result_message: description.to_string(),
            confirmation_id: receipt,
        }
    }

    pub fn expired() -> Self {
        TerminalOutcome {
            status: PaymentStatus::Expired,
            result_code: None,
            result_message: "Payment timed out, please retry".to_string(),
            confirmation_id: None,
        }
    }

    pub fn cancelled(reason: Option<&str>) -> Self {
        TerminalOutcome {
            status: PaymentStatus::Cancelled,
            result_code: None,
            result_message: reason.unwrap_or("Cancelled by operator").to_string(),
            confirmation_id: None,
        }
    }
}

/// Result of a finalize call against the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalization {
    /// This call moved the attempt to a terminal state.
    Applied(PaymentAttempt),
    /// The attempt was not pending; the stored attempt is returned as-is.
    Unchanged(PaymentAttempt),
}

impl Finalization {
    pub fn attempt(&self) -> &PaymentAttempt {
        match self {
            Finalization::Applied(attempt) | Finalization::Unchanged(attempt) => attempt,
        }
    }

    pub fn into_attempt(self) -> PaymentAttempt {
        match self {
            Finalization::Applied(attempt) | Finalization::Unchanged(attempt) => attempt,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Finalization::Applied(_))
    }
}

/// Consumer-facing view of an attempt.
#[derive(Debug, Serialize)]
pub struct PaymentStatusView {
    pub transaction_id: String,
    pub order_id: String,
    pub status: PaymentStatus,
    pub amount: f64,
    pub time_remaining_secs: i64,
    pub can_retry: bool,
    pub result_code: Option<i32>,
    pub result_message: Option<String>,
    pub receipt_number: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentStatusView {
    pub fn new(attempt: &PaymentAttempt, time_remaining_secs: i64) -> Self {
        PaymentStatusView {
            transaction_id: attempt.transaction_id.clone(),
            order_id: attempt.order_id.clone(),
            status: attempt.status,
            amount: attempt.amount,
            time_remaining_secs,
            can_retry: attempt.can_retry(),
            result_code: attempt.result_code,
            result_message: attempt.result_message.clone(),
            receipt_number: attempt.gateway_confirmation_id.clone(),
            expires_at: attempt.expires_at,
            completed_at: attempt.completed_at,
        }
    }
}
