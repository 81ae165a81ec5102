use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::payment_handlers;
use crate::state::AppState;

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/stk-push", post(payment_handlers::initiate_stk_push))
        .route("/order/:order_id", get(payment_handlers::get_order_payments))
        .route("/:transaction_id", get(payment_handlers::get_payment_status))
        .route("/:transaction_id/cancel", post(payment_handlers::cancel_payment))
        .route("/:transaction_id/retry", post(payment_handlers::retry_payment))
}
