use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::payment_attempt::{PaymentAttempt, PaymentStatusView};

#[derive(Debug, Deserialize, Validate)]
pub struct StkPushPayload {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,

    /// Shown to the payer as the account reference. Defaults to the order id.
    #[validate(length(max = 12, message = "order_reference must be at most 12 characters"))]
    pub order_reference: Option<String>,

    /// Whole shillings. Fractions are refused when the push is initiated.
    #[validate(range(min = 1.0, message = "Amount must be at least 1"))]
    pub amount: f64,

    #[validate(length(min = 9, max = 16, message = "Phone number is invalid"))]
    pub phone_number: String,

    #[validate(length(max = 100, message = "Description is too long"))]
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelPayload {
    #[validate(length(max = 200, message = "Reason is too long"))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub success: bool,
    #[serde(flatten)]
    pub payment: PaymentStatusView,
}

impl PaymentResponse {
    pub fn new(payment: PaymentStatusView) -> Self {
        PaymentResponse {
            success: true,
            payment,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentHistoryResponse {
    pub success: bool,
    pub order_id: String,
    pub attempts: Vec<PaymentAttempt>,
}
