pub(crate) mod mpesa;
pub(crate) mod payments;
pub(crate) mod reconciliation;

use axum::{extract::State, http::Method, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::database::connection::ping;
use crate::state::AppState;

pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_credentials(false);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_check))
        .route("/api/health", get(api_health_check))
        .nest("/api/payments", payments::payment_routes())
        .nest("/api/mpesa", mpesa::mpesa_routes())
        .nest("/api/reconciliation", reconciliation::reconciliation_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

async fn root_handler() -> &'static str {
    "🧾 POS Payments API"
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn api_health_check(State(state): State<AppState>) -> Json<Value> {
    let database = match &state.db {
        Some(db) => {
            if ping(db).await {
                "connected"
            } else {
                "disconnected"
            }
        }
        None => "not used",
    };

    Json(json!({
        "status": "healthy",
        "ledger": state.ledger.backend(),
        "database": database,
        "gateway": state.payments.as_ref().map(|p| p.gateway_name()),
        "mpesa": state.payments.is_some(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::database::ledger::{InMemoryLedger, TransactionLedger};
    use crate::database::reconciliation_store::InMemoryReconciliationStore;
    use crate::models::payment_attempt::PaymentStatus;
    use crate::models::reconciliation::{OrderPayment, OrderRecord, OrderStatus, PaymentMethod};
    use crate::services::callback_auth::CallbackAuthenticator;
    use crate::services::gateway::mock::MockGateway;
    use crate::services::payment_service::PaymentService;
    use crate::services::reconciliation_service::ReconciliationService;
    use crate::services::status_poller::PollerRegistry;
    use crate::config::DEFAULT_SIGNATURE_HEADER;

    const SECRET: &str = "callback-secret";

    struct Harness {
        app: Router,
        ledger: Arc<InMemoryLedger>,
        gateway: Arc<MockGateway>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let gateway = Arc::new(MockGateway::accepting());
        let orders = Arc::new(InMemoryReconciliationStore::new());
        orders
            .insert_order(OrderRecord {
                order_id: "o-1".into(),
                shop_id: "shop-1".into(),
                order_number: "ORD-1".into(),
                total: 10000.0,
                status: OrderStatus::Completed,
                created_at: "2024-06-01T10:00:00Z".parse().unwrap(),
                payments: vec![
                    OrderPayment {
                        method: PaymentMethod::Cash,
                        amount: 10000.0,
                        mpesa_receipt_number: None,
                    },
                    OrderPayment {
                        method: PaymentMethod::Mpesa,
                        amount: 250.0,
                        mpesa_receipt_number: Some("ABC123".into()),
                    },
                ],
            })
            .unwrap();

        let payments = Arc::new(PaymentService::new(
            gateway.clone(),
            ledger.clone(),
            Arc::new(PollerRegistry::new()),
            Duration::from_secs(300),
            Duration::from_secs(3),
            Duration::from_secs(30),
        ));
        let state = AppState::new(None, ledger.clone(), Arc::new(ReconciliationService::new(orders, 2.0)))
            .with_payments(
                payments,
                Arc::new(CallbackAuthenticator::new(SECRET).unwrap()),
                DEFAULT_SIGNATURE_HEADER,
            );

        Harness {
            app: build_router(state),
            ledger,
            gateway,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn callback(checkout_request_id: &str, result_code: i32, receipt: &str) -> Vec<u8> {
        json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "mr-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "Amount", "Value": 1500 },
                    { "Name": "MpesaReceiptNumber", "Value": receipt }
                ]}
            }}
        })
        .to_string()
        .into_bytes()
    }

    fn signed_callback(body: Vec<u8>, signature: &str) -> Request<Body> {
        Request::post("/api/mpesa/callback")
            .header("content-type", "application/json")
            .header(DEFAULT_SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    async fn initiate(app: &Router, order_id: &str) -> (StatusCode, Value) {
        send(
            app,
            post_json(
                "/api/payments/stk-push",
                json!({ "order_id": order_id, "amount": 1500.0, "phone_number": "0712345678" }),
            ),
        )
        .await
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let h = harness();
        let (status, body) = send(&h.app, Request::get("/api/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ledger"], "memory");
        assert_eq!(body["database"], "not used");
        assert_eq!(body["gateway"], "mock");
    }

    #[tokio::test]
    async fn stk_push_refuses_fractional_shillings() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/payments/stk-push",
                json!({ "order_id": "o-1", "amount": 99.5, "phone_number": "0712345678" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(h.gateway.push_count(), 0);
        assert!(h.ledger.list_for_order("o-1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stk_push_then_status_then_conflict() {
        let h = harness();
        let (status, body) = initiate(&h.app, "o-1").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["can_retry"], false);
        let transaction_id = body["transaction_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &h.app,
            Request::get(format!("/api/payments/{}", transaction_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["time_remaining_secs"].as_i64().unwrap() > 290);

        let (status, body) = initiate(&h.app, "o-1").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(h.gateway.push_count(), 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_the_gateway() {
        let h = harness();
        let (status, _) = send(
            &h.app,
            post_json(
                "/api/payments/stk-push",
                json!({ "order_id": "o-1", "amount": 0.0, "phone_number": "0712345678" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(h.gateway.push_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signed_callback_completes_and_forged_one_is_ignored() {
        let h = harness();
        let (_, body) = initiate(&h.app, "o-1").await;
        let transaction_id = body["transaction_id"].as_str().unwrap().to_string();
        let checkout = h
            .ledger
            .get(&transaction_id)
            .await
            .unwrap()
            .unwrap()
            .gateway_request_id
            .unwrap();

        // Forged: acknowledged, ledger untouched.
        let forged = callback(&checkout, 0, "FAKE00");
        let (status, body) = send(&h.app, signed_callback(forged, "bm90LWEtc2lnbmF0dXJl")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ResultCode"], 0);
        let attempt = h.ledger.get(&transaction_id).await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Pending);

        let genuine = callback(&checkout, 0, "NLJ7RT61SV");
        let signature = CallbackAuthenticator::new(SECRET).unwrap().sign(&genuine);
        let (status, _) = send(&h.app, signed_callback(genuine, &signature)).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = send(
            &h.app,
            Request::get(format!("/api/payments/{}", transaction_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["receipt_number"], "NLJ7RT61SV");
        assert_eq!(body["time_remaining_secs"], 0);

        let (status, _) = send(
            &h.app,
            Request::post(format!("/api/payments/{}/retry", transaction_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_then_history() {
        let h = harness();
        let (_, body) = initiate(&h.app, "o-1").await;
        let transaction_id = body["transaction_id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &h.app,
            post_json(
                &format!("/api/payments/{}/cancel", transaction_id),
                json!({ "reason": "customer walked away" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["can_retry"], true);
        assert_eq!(body["result_message"], "customer walked away");

        let (status, body) = send(
            &h.app,
            Request::get("/api/payments/order/o-1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["attempts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let h = harness();
        let (status, body) = send(
            &h.app,
            Request::get("/api/payments/does-not-exist").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn reconcile_match_and_summarize() {
        let h = harness();
        let (status, record) = send(
            &h.app,
            post_json(
                "/api/reconciliation/shop-1",
                json!({
                    "period_start": "2024-06-01T08:00:00Z",
                    "period_end": "2024-06-01T18:00:00Z",
                    "actual_cash": 9800.0,
                    "reconciled_by": "cashier-7"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(record["variance"], -200.0);
        assert_eq!(record["variance_percentage"], -2.0);
        assert_eq!(record["status"], "reconciled");

        let (status, report) = send(
            &h.app,
            post_json(
                "/api/reconciliation/shop-1/match",
                json!({
                    "period_start": "2024-06-01T08:00:00Z",
                    "period_end": "2024-06-01T18:00:00Z",
                    "gateway_transactions": [
                        { "receipt_number": "ABC123", "amount": 250.0 },
                        { "receipt_number": "XYZ999", "amount": 40.0 }
                    ]
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["matched"], 1);
        assert_eq!(report["unmatched"], 0);
        assert_eq!(report["discrepancies"][0]["kind"], "gateway_without_order");

        let (status, summary) = send(
            &h.app,
            Request::get("/api/reconciliation/shop-1?from=2024-06-01T00:00:00Z&to=2024-06-02T00:00:00Z")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["records"].as_array().unwrap().len(), 1);
        assert_eq!(summary["needs_review"], 0);
    }

    #[tokio::test]
    async fn inverted_period_is_a_bad_request() {
        let h = harness();
        let (status, _) = send(
            &h.app,
            post_json(
                "/api/reconciliation/shop-1",
                json!({
                    "period_start": "2024-06-01T18:00:00Z",
                    "period_end": "2024-06-01T08:00:00Z",
                    "actual_cash": 100.0
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
