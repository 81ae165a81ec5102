// services/mpesa_service.rs
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Response, StatusCode};
use tracing::{debug, error, info};

use crate::config::MpesaConfig;
use crate::errors::{AppError, Result};
use crate::models::mpesa::{
    AuthResponse, GatewayErrorBody, StkPushRequest, StkPushResponse, StkQueryRequest, StkQueryResponse,
};
use crate::services::gateway::{PaymentGateway, PushAccepted, PushRequest, QueryStatus};
use crate::services::token_cache::{Credential, CredentialCache, TokenSource};

/// Daraja's "still processing" answer to a status query.
const QUERY_IN_PROGRESS: &str = "500.001.1001";

/// Normalizes a Kenyan MSISDN to `2547XXXXXXXX` / `2541XXXXXXXX`.
pub fn normalize_phone_number(phone: &str) -> Result<String> {
    let digits: String = phone
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '+'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::invalid_data(format!("'{}' is not a phone number", phone)));
    }

    let local = if digits.starts_with("254") && digits.len() == 12 {
        &digits[3..]
    } else if digits.starts_with('0') && digits.len() == 10 {
        &digits[1..]
    } else if digits.len() == 9 {
        digits.as_str()
    } else {
        return Err(AppError::invalid_data(format!("'{}' is not a Kenyan mobile number", phone)));
    };

    if !(local.starts_with('7') || local.starts_with('1')) {
        return Err(AppError::invalid_data(format!("'{}' is not a Kenyan mobile number", phone)));
    }

    Ok(format!("254{}", local))
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

/// STK password: base64(short code + passkey + timestamp).
pub fn generate_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{}{}{}", short_code, passkey, timestamp))
}

/// Daraja only takes whole shillings.
/// Callers only pass whole shillings; see `PaymentService::initiate`.
fn format_amount(amount: f64) -> String {
    format!("{:.0}", amount)
}

/// Client-credentials OAuth against Daraja.
pub struct DarajaAuth {
    config: MpesaConfig,
    client: Client,
}

impl DarajaAuth {
    pub fn new(config: MpesaConfig, client: Client) -> Self {
        DarajaAuth { config, client }
    }
}

#[async_trait]
impl TokenSource for DarajaAuth {
    async fn fetch(&self) -> Result<Credential> {
        let encoded_auth = base64.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));

        let response = self
            .client
            .get(self.config.auth_url())
            .header(header::AUTHORIZATION, format!("Basic {}", encoded_auth))
            .send()
            .await
            .map_err(|e| AppError::AuthenticationFailure(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Failed to get access token: {} - {}", status, body);
            return Err(AppError::AuthenticationFailure(format!("M-Pesa auth failed: {}", status)));
        }

        let auth_response: AuthResponse = response
            .json()
            .await
            .map_err(|e| AppError::AuthenticationFailure(format!("bad token payload: {}", e)))?;

        info!("Access token obtained, valid for {}s", auth_response.expires_in);
        let lifetime = i64::try_from(auth_response.expires_in).unwrap_or(3599);
        Ok(Credential {
            token: auth_response.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }
}

pub struct MpesaService {
    config: MpesaConfig,
    client: Client,
    tokens: Arc<CredentialCache>,
}

impl MpesaService {
    pub fn new(config: MpesaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to create HTTP client: {}", e)))?;

        let auth = Arc::new(DarajaAuth::new(config.clone(), client.clone()));
        let tokens = Arc::new(CredentialCache::new(auth, config.token_safety_margin));

        Ok(MpesaService {
            config,
            client,
            tokens,
        })
    }

    pub async fn get_access_token(&self) -> Result<String> {
        self.tokens.get_token().await
    }

    fn signed_password(&self) -> (String, String) {
        let timestamp = format_timestamp(Utc::now());
        let password = generate_password(&self.config.short_code, &self.config.passkey, &timestamp);
        (password, timestamp)
    }

    /// Turns a non-2xx response into `GatewayRejected` with Daraja's message.
    async fn rejection(&self, response: Response) -> AppError {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate();
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<GatewayErrorBody>(&body) {
            Ok(GatewayErrorBody {
                request_id,
                error_code,
                error_message: Some(message),
            }) => {
                if error_code.as_deref() == Some(QUERY_IN_PROGRESS) {
                    debug!("Daraja: {}", message);
                } else {
                    error!(
                        request_id = ?request_id,
                        "Daraja rejected request: {} - {:?} {}", status, error_code, message
                    );
                }
                AppError::GatewayRejected(message)
            }
            _ => {
                error!("Daraja rejected request: {} - {}", status, body);
                AppError::GatewayRejected(if body.is_empty() { status.to_string() } else { body })
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for MpesaService {
    fn name(&self) -> &'static str {
        "mpesa"
    }

    async fn push(&self, request: &PushRequest) -> Result<PushAccepted> {
        info!("C2B: STK push for {} - KSh {}", request.phone_number, request.amount);

        let access_token = self.get_access_token().await?;
        let (password, timestamp) = self.signed_password();
        let amount = format_amount(request.amount);

        let stk_request = StkPushRequest {
            business_short_code: self.config.short_code.clone(),
            password,
            timestamp,
            transaction_type: "CustomerPayBillOnline".to_string(),
            amount,
            party_a: request.phone_number.clone(),
            party_b: self.config.short_code.clone(),
            phone_number: request.phone_number.clone(),
            callback_url: self.config.callback_url.clone(),
            account_reference: request.account_reference.clone(),
            transaction_desc: request.description.clone(),
        };

        let response = self
            .client
            .post(self.config.stk_push_url())
            .bearer_auth(access_token)
            .json(&stk_request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.rejection(response).await);
        }

        let stk_response: StkPushResponse = response
            .json()
            .await
            .map_err(|e| AppError::rejected(format!("unreadable push response: {}", e)))?;

        if stk_response.response_code != "0" {
            error!(
                "C2B rejected: {} - {}",
                stk_response.response_code, stk_response.response_description
            );
            return Err(AppError::rejected(stk_response.response_description));
        }

        info!("C2B initiated: {}", stk_response.checkout_request_id);
        Ok(PushAccepted {
            checkout_request_id: stk_response.checkout_request_id,
            merchant_request_id: stk_response.merchant_request_id,
            customer_message: stk_response.customer_message,
        })
    }

    async fn query(&self, checkout_request_id: &str) -> Result<QueryStatus> {
        let access_token = self.get_access_token().await?;
        let (password, timestamp) = self.signed_password();

        let query = StkQueryRequest {
            business_short_code: self.config.short_code.clone(),
            password,
            timestamp,
            checkout_request_id: checkout_request_id.to_string(),
        };

        let response = self
            .client
            .post(self.config.stk_query_url())
            .bearer_auth(access_token)
            .json(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = self.rejection(response).await;
            return match err {
                AppError::GatewayRejected(ref message) if message.contains("being processed") => {
                    Ok(QueryStatus::Pending)
                }
                other => Err(other),
            };
        }

        let body: StkQueryResponse = response
            .json()
            .await
            .map_err(|e| AppError::rejected(format!("unreadable query response: {}", e)))?;

        Ok(match body.result_code {
            Some(result_code) => QueryStatus::Final {
                result_code,
                description: body.result_desc.unwrap_or_default(),
            },
            None => QueryStatus::Pending,
        })
    }
}
