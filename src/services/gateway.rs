// services/gateway.rs
use async_trait::async_trait;

use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub amount: f64,
    /// Normalized MSISDN, e.g. `254712345678`.
    pub phone_number: String,
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct PushAccepted {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    /// The gateway is still waiting on the payer.
    Pending,
    Final { result_code: i32, description: String },
}

/// The push-payment gateway as seen by the initiator and the poller.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sends the push. Rejections surface as `GatewayRejected`.
    async fn push(&self, request: &PushRequest) -> Result<PushAccepted>;

    /// One status query for a checkout request.
    async fn query(&self, checkout_request_id: &str) -> Result<QueryStatus>;

    /// Asks the gateway to abandon a pending push. `Ok(false)` when the
    /// gateway has no such operation.
    async fn cancel(&self, _checkout_request_id: &str) -> Result<bool> {
        Ok(false)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::errors::AppError;

    /// Scripted gateway. Queries pop from `query_script` and report `Pending`
    /// once it runs dry.
    #[derive(Default)]
    pub struct MockGateway {
        pub reject_push: Option<String>,
        pub push_delay: Option<Duration>,
        pub query_delay: Option<Duration>,
        pub query_script: Mutex<VecDeque<Result<QueryStatus>>>,
        pub pushes: AtomicUsize,
        pub queries: AtomicUsize,
        pub cancels: AtomicUsize,
    }

    impl MockGateway {
        pub fn accepting() -> Self {
            Self::default()
        }

        pub fn rejecting(message: &str) -> Self {
            MockGateway {
                reject_push: Some(message.to_string()),
                ..Self::default()
            }
        }

        pub fn with_script(script: Vec<Result<QueryStatus>>) -> Self {
            MockGateway {
                query_script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        pub fn slow_push(delay: Duration) -> Self {
            MockGateway {
                push_delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn hanging(delay: Duration) -> Self {
            MockGateway {
                query_delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn push_count(&self) -> usize {
            self.pushes.load(Ordering::SeqCst)
        }

        pub fn query_count(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn push(&self, request: &PushRequest) -> Result<PushAccepted> {
            let n = self.pushes.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(delay) = self.push_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.reject_push {
                return Err(AppError::rejected(message.clone()));
            }
            Ok(PushAccepted {
                checkout_request_id: format!("ws_CO_MOCK_{}_{}", request.account_reference, n),
                merchant_request_id: format!("mr-{}", n),
                customer_message: "Success. Request accepted for processing".to_string(),
            })
        }

        async fn query(&self, _checkout_request_id: &str) -> Result<QueryStatus> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.query_delay {
                tokio::time::sleep(delay).await;
            }
            let next = self
                .query_script
                .lock()
                .ok()
                .and_then(|mut script| script.pop_front());
            next.unwrap_or(Ok(QueryStatus::Pending))
        }

        async fn cancel(&self, _checkout_request_id: &str) -> Result<bool> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }
}
