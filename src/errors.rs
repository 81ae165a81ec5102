// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MongoDB error: {0}")]
    MongoDB(#[from] mongodb::error::Error),

    #[error("M-Pesa authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("{0}")]
    GatewayRejected(String),

    #[error("Gateway transport error: {0}")]
    TransportError(String),

    #[error("Callback signature is invalid")]
    SignatureInvalid,

    #[error("Payment timed out, please retry")]
    ExpiredAttempt,

    #[error("Order {0} already has a payment in progress")]
    PendingAttemptExists(String),

    #[error("Payment {0} cannot be retried")]
    RetryNotAllowed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Service error: {0}")]
    ServiceError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::MongoDB(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Database error"),
            AppError::AuthenticationFailure(_) => (StatusCode::BAD_GATEWAY, "M-Pesa authentication failed"),
            AppError::GatewayRejected(_) => (StatusCode::BAD_GATEWAY, "M-Pesa rejected the request"),
            AppError::TransportError(_) => (StatusCode::SERVICE_UNAVAILABLE, "M-Pesa unreachable"),
            AppError::SignatureInvalid => (StatusCode::UNAUTHORIZED, "Invalid signature"),
            AppError::ExpiredAttempt => (StatusCode::GONE, "Payment timed out"),
            AppError::PendingAttemptExists(_) => (StatusCode::CONFLICT, "Payment already in progress"),
            AppError::RetryNotAllowed(_) => (StatusCode::CONFLICT, "Retry not allowed"),
            AppError::ValidationError(_) => (StatusCode::BAD_REQUEST, "Validation failed"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found"),
            AppError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable"),
            AppError::ConfigurationError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Configuration error"),
            AppError::ServiceError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Service error"),
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ValidationError(format!("JSON parsing error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::TransportError(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

// Helper conversion functions
impl AppError {
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        AppError::ValidationError(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        AppError::GatewayRejected(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        AppError::ConfigurationError(msg.into())
    }

    pub fn service(msg: impl Into<String>) -> Self {
        AppError::ServiceError(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
