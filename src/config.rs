// config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::services::reconciliation_service::DEFAULT_TOLERANCE_PERCENT;

/// Header carrying the callback HMAC unless `MPESA_SIGNATURE_HEADER` says otherwise.
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Mpesa-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Mongo,
    Memory,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    /// Shared secret for callback HMACs. Falls back to the passkey.
    pub callback_secret: String,
    pub signature_header: String,
    pub environment: String,
    pub http_timeout: Duration,
    pub token_safety_margin: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` when the M-Pesa credentials are not configured.
    pub mpesa: Option<MpesaConfig>,
    pub payment_timeout: Duration,
    pub poll_interval: Duration,
    pub variance_tolerance_percent: f64,
    pub ledger_backend: LedgerBackend,
    pub database_url: String,
    pub database_name: String,
    pub log_level: tracing::Level,
    pub port: u16,
    pub host: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let ledger_backend = match env::var("LEDGER_BACKEND")
            .unwrap_or_else(|_| "mongo".to_string())
            .as_str()
        {
            "mongo" => LedgerBackend::Mongo,
            "memory" => LedgerBackend::Memory,
            other => {
                return Err(AppError::configuration(format!(
                    "LEDGER_BACKEND must be 'mongo' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let database_url = match ledger_backend {
            LedgerBackend::Mongo => required("DATABASE_URL")?,
            LedgerBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
        };

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .map(|level| {
                tracing::Level::from_str(&level)
                    .map_err(|_| AppError::configuration(format!("LOG_LEVEL '{}' is not a level", level)))
            })
            .transpose()?
            .unwrap_or(tracing::Level::INFO);

        Ok(AppConfig {
            mpesa: MpesaConfig::from_env()?,
            payment_timeout: Duration::from_secs(parsed("PAYMENT_TIMEOUT_SECS", 300)?),
            poll_interval: Duration::from_secs(parsed("PAYMENT_POLL_INTERVAL_SECS", 3)?),
            variance_tolerance_percent: parsed("RECONCILIATION_TOLERANCE_PERCENT", DEFAULT_TOLERANCE_PERCENT)?,
            ledger_backend,
            database_url,
            database_name: env::var("DATABASE_NAME").unwrap_or_else(|_| "posdb".to_string()),
            log_level,
            port: parsed("PORT", 3000)?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
        })
    }
}

impl MpesaConfig {
    /// Reads the Daraja settings. Returns `Ok(None)` when no consumer key is
    /// set so the service can still boot without payments.
    pub fn from_env() -> Result<Option<Self>> {
        let consumer_key = match env::var("MPESA_CONSUMER_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => return Ok(None),
        };
        let passkey = required("MPESA_PASSKEY")?;

        Ok(Some(MpesaConfig {
            consumer_key,
            consumer_secret: required("MPESA_CONSUMER_SECRET")?,
            short_code: required("MPESA_SHORT_CODE")?,
            callback_url: required("MPESA_CALLBACK_URL")?,
            callback_secret: env::var("MPESA_CALLBACK_SECRET").unwrap_or_else(|_| passkey.clone()),
            passkey,
            signature_header: env::var("MPESA_SIGNATURE_HEADER")
                .unwrap_or_else(|_| DEFAULT_SIGNATURE_HEADER.to_string()),
            environment: env::var("MPESA_ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string()),
            http_timeout: Duration::from_secs(parsed("MPESA_HTTP_TIMEOUT_SECS", 30)?),
            token_safety_margin: Duration::from_secs(parsed("TOKEN_SAFETY_MARGIN_SECS", 60)?),
        }))
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn base_url(&self) -> &'static str {
        if self.is_production() {
            "https://api.safaricom.co.ke"
        } else {
            "https://sandbox.safaricom.co.ke"
        }
    }

    pub fn auth_url(&self) -> String {
        format!("{}/oauth/v1/generate?grant_type=client_credentials", self.base_url())
    }

    pub fn stk_push_url(&self) -> String {
        format!("{}/mpesa/stkpush/v1/processrequest", self.base_url())
    }

    pub fn stk_query_url(&self) -> String {
        format!("{}/mpesa/stkpushquery/v1/query", self.base_url())
    }

    pub fn get_config_info(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.environment,
            "is_production": self.is_production(),
            "business_shortcode": self.short_code,
            "callback_url": self.callback_url,
            "signature_header": self.signature_header,
            "consumer_key_set": !self.consumer_key.is_empty(),
            "consumer_secret_set": !self.consumer_secret.is_empty(),
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| AppError::configuration(format!("{} must be set", name)))
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::configuration(format!("{} has an invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_mpesa_config() -> MpesaConfig {
    MpesaConfig {
        consumer_key: "key".to_string(),
        consumer_secret: "secret".to_string(),
        short_code: "174379".to_string(),
        passkey: "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919".to_string(),
        callback_url: "https://pos.example.com/api/mpesa/callback".to_string(),
        callback_secret: "callback-secret".to_string(),
        signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
        environment: "sandbox".to_string(),
        http_timeout: Duration::from_secs(5),
        token_safety_margin: Duration::from_secs(60),
    }
}
