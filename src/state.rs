use std::sync::Arc;

use mongodb::Database;

use crate::config::{MpesaConfig, DEFAULT_SIGNATURE_HEADER};
use crate::database::ledger::TransactionLedger;
use crate::services::callback_auth::CallbackAuthenticator;
use crate::services::payment_service::PaymentService;
use crate::services::reconciliation_service::ReconciliationService;

#[derive(Clone)]
pub struct AppState {
    /// `None` when running on the in-memory backends.
    pub db: Option<Database>,
    pub ledger: Arc<dyn TransactionLedger>,
    pub reconciliation: Arc<ReconciliationService>,
    pub payments: Option<Arc<PaymentService>>,
    pub callback_auth: Option<Arc<CallbackAuthenticator>>,
    pub signature_header: String,
    pub mpesa_config: Option<MpesaConfig>,
}

impl AppState {
    pub fn new(
        db: Option<Database>,
        ledger: Arc<dyn TransactionLedger>,
        reconciliation: Arc<ReconciliationService>,
    ) -> Self {
        AppState {
            db,
            ledger,
            reconciliation,
            payments: None,
            callback_auth: None,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            mpesa_config: None,
        }
    }

    pub fn with_payments(
        mut self,
        payments: Arc<PaymentService>,
        callback_auth: Arc<CallbackAuthenticator>,
        signature_header: &str,
    ) -> Self {
        self.payments = Some(payments);
        self.callback_auth = Some(callback_auth);
        self.signature_header = signature_header.to_string();
        self
    }

    pub fn with_mpesa_config(mut self, config: MpesaConfig) -> Self {
        self.mpesa_config = Some(config);
        self
    }
}
