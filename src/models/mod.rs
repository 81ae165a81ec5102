pub mod mpesa;
pub mod payment_attempt;
pub mod reconciliation;
