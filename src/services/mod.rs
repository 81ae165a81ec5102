pub(crate) mod callback_auth;
pub(crate) mod gateway;
pub(crate) mod mpesa_service;
pub(crate) mod payment_service;
pub(crate) mod reconciliation_service;
pub(crate) mod status_poller;
pub(crate) mod token_cache;
