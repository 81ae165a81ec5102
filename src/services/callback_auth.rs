// services/callback_auth.rs
//! Authentication of inbound gateway callbacks.

use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::errors::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Verifies `base64(HMAC-SHA256(secret, raw_body))` signatures.
#[derive(Clone)]
pub struct CallbackAuthenticator {
    mac: HmacSha256,
}

impl CallbackAuthenticator {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|_| AppError::configuration("invalid callback secret"))?;
        Ok(CallbackAuthenticator { mac })
    }

    pub fn sign(&self, raw_body: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(raw_body);
        base64.encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of the expected signature with the header.
    pub fn verify(&self, raw_body: &[u8], signature_header: &str) -> bool {
        let expected = self.sign(raw_body);
        expected
            .as_bytes()
            .ct_eq(signature_header.trim().as_bytes())
            .into()
    }

    pub fn authenticate(&self, raw_body: &[u8], signature_header: Option<&str>) -> Result<()> {
        match signature_header {
            Some(signature) if self.verify(raw_body, signature) => Ok(()),
            _ => Err(AppError::SignatureInvalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"Body":{"stkCallback":{"MerchantRequestID":"m","CheckoutRequestID":"c","ResultCode":0,"ResultDesc":"ok"}}}"#;

    #[test]
    fn valid_signature_verifies() {
        let auth = CallbackAuthenticator::new("passkey").unwrap();
        let signature = auth.sign(BODY);
        assert!(auth.verify(BODY, &signature));
        assert!(auth.authenticate(BODY, Some(&signature)).is_ok());
    }

    #[test]
    fn any_single_byte_mutation_fails() {
        let auth = CallbackAuthenticator::new("passkey").unwrap();
        let signature = auth.sign(BODY);

        for i in 0..BODY.len() {
            let mut tampered = BODY.to_vec();
            tampered[i] ^= 0x01;
            assert!(!auth.verify(&tampered, &signature), "mutation at byte {} verified", i);
        }
    }

    #[test]
    fn wrong_secret_fails() {
        let signer = CallbackAuthenticator::new("attacker").unwrap();
        let auth = CallbackAuthenticator::new("passkey").unwrap();
        assert!(!auth.verify(BODY, &signer.sign(BODY)));
    }

    #[test]
    fn missing_or_garbage_header_is_rejected() {
        let auth = CallbackAuthenticator::new("passkey").unwrap();
        assert!(matches!(auth.authenticate(BODY, None), Err(AppError::SignatureInvalid)));
        assert!(!auth.verify(BODY, ""));
        assert!(!auth.verify(BODY, "not-a-signature"));
    }
}
