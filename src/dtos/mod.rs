pub(crate) mod payment_dtos;
pub(crate) mod reconciliation_dtos;
