use axum::{
    routing::post,
    Router,
};

use crate::handlers::reconciliation_handlers;
use crate::state::AppState;

pub fn reconciliation_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/:shop_id",
            post(reconciliation_handlers::reconcile_period).get(reconciliation_handlers::variance_summary),
        )
        .route("/:shop_id/match", post(reconciliation_handlers::match_transactions))
}
