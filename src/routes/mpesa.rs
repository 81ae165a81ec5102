use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::mpesa_handlers;
use crate::state::AppState;

pub fn mpesa_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(mpesa_handlers::mpesa_health))
        .route("/config", get(mpesa_handlers::mpesa_config))
        .route("/callback", post(mpesa_handlers::mpesa_callback))
}
