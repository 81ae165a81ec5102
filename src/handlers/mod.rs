pub(crate) mod mpesa_handlers;
pub(crate) mod payment_handlers;
pub(crate) mod reconciliation_handlers;
