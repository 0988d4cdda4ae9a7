//! Webhook signature verification.

use axum::http::HeaderMap;

use pagecredit_core::Provider;

use crate::crypto::{constant_time_eq, hmac_sha256_hex};

/// Header carrying Stripe's `t=...,v1=...` signature.
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
/// Header carrying the hex HMAC of a PayPal body.
pub const PAYPAL_SIGNATURE_HEADER: &str = "x-paypal-signature";

/// Why a webhook failed verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// No signature header on the request.
    #[error("missing {0} header")]
    MissingSignature(&'static str),
    /// The header could not be parsed.
    #[error("malformed signature header: {0}")]
    Malformed(String),
    /// No signature matched.
    #[error("invalid webhook signature")]
    InvalidSignature,
}

/// Authenticates a webhook body before it reaches the gateway.
pub trait WebhookVerifier: Send + Sync {
    /// Check `body` against the request headers.
    ///
    /// # Errors
    ///
    /// Returns a [`VerifyError`] when the request is not authentic.
    fn verify(&self, provider: Provider, headers: &HeaderMap, body: &[u8])
        -> Result<(), VerifyError>;
}

/// HMAC-SHA256 verification with one shared secret per provider.
///
/// A provider without a secret is passed through unverified.
#[derive(Debug, Clone, Default)]
pub struct HmacVerifier {
    stripe_secret: Option<String>,
    paypal_secret: Option<String>,
}

impl HmacVerifier {
    /// Create a verifier from optional per-provider secrets.
    #[must_use]
    pub fn new(stripe_secret: Option<String>, paypal_secret: Option<String>) -> Self {
        for (provider, secret) in [
            (Provider::Stripe, &stripe_secret),
            (Provider::PayPal, &paypal_secret),
        ] {
            if secret.is_none() {
                tracing::warn!(
                    provider = %provider,
                    "Webhook secret not configured - skipping signature verification"
                );
            }
        }
        Self {
            stripe_secret,
            paypal_secret,
        }
    }

    fn secret(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Stripe => self.stripe_secret.as_deref(),
            Provider::PayPal => self.paypal_secret.as_deref(),
        }
    }
}

impl WebhookVerifier for HmacVerifier {
    fn verify(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), VerifyError> {
        let Some(secret) = self.secret(provider) else {
            return Ok(());
        };

        let header_name = match provider {
            Provider::Stripe => STRIPE_SIGNATURE_HEADER,
            Provider::PayPal => PAYPAL_SIGNATURE_HEADER,
        };
        let signature = headers
            .get(header_name)
            .and_then(|v| v.to_str().ok())
            .ok_or(VerifyError::MissingSignature(header_name))?;

        match provider {
            Provider::Stripe => verify_stripe(secret, signature, body),
            Provider::PayPal => verify_plain(secret, signature, body),
        }
    }
}

/// Verify a Stripe `t=timestamp,v1=sig[,v1=sig...]` header.
fn verify_stripe(secret: &str, header: &str, body: &[u8]) -> Result<(), VerifyError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", ts)) => timestamp = Some(ts),
            Some(("v1", sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| VerifyError::Malformed("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(VerifyError::InvalidSignature);
    }

    let mut signed_payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
    signed_payload.extend_from_slice(timestamp.as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);

    let expected = hmac_sha256_hex(secret, &signed_payload).ok_or(VerifyError::InvalidSignature)?;
    if signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        Ok(())
    } else {
        Err(VerifyError::InvalidSignature)
    }
}

fn verify_plain(secret: &str, signature: &str, body: &[u8]) -> Result<(), VerifyError> {
    let expected = hmac_sha256_hex(secret, body).ok_or(VerifyError::InvalidSignature)?;
    if constant_time_eq(&expected, &signature.trim().to_ascii_lowercase()) {
        Ok(())
    } else {
        Err(VerifyError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const BODY: &[u8] = br#"{"id":"evt_1"}"#;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn stripe_header(secret: &str, body: &[u8]) -> String {
        let mut signed = b"1700000000.".to_vec();
        signed.extend_from_slice(body);
        format!("t=1700000000,v1={}", hmac_sha256_hex(secret, &signed).unwrap())
    }

    #[test]
    fn passes_through_without_secret() {
        let verifier = HmacVerifier::new(None, None);
        assert!(verifier
            .verify(Provider::Stripe, &HeaderMap::new(), BODY)
            .is_ok());
    }

    #[test]
    fn stripe_signature_round_trip() {
        let verifier = HmacVerifier::new(Some("whsec_test".into()), None);
        let good = headers(STRIPE_SIGNATURE_HEADER, &stripe_header("whsec_test", BODY));
        assert!(verifier.verify(Provider::Stripe, &good, BODY).is_ok());

        let wrong_secret = headers(STRIPE_SIGNATURE_HEADER, &stripe_header("other", BODY));
        assert_eq!(
            verifier.verify(Provider::Stripe, &wrong_secret, BODY),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn stripe_requires_header_and_timestamp() {
        let verifier = HmacVerifier::new(Some("whsec_test".into()), None);
        assert_eq!(
            verifier.verify(Provider::Stripe, &HeaderMap::new(), BODY),
            Err(VerifyError::MissingSignature(STRIPE_SIGNATURE_HEADER))
        );
        let no_ts = headers(STRIPE_SIGNATURE_HEADER, "v1=abc");
        assert!(matches!(
            verifier.verify(Provider::Stripe, &no_ts, BODY),
            Err(VerifyError::Malformed(_))
        ));
    }

    #[test]
    fn paypal_signature_is_body_hmac() {
        let verifier = HmacVerifier::new(None, Some("pp_secret".into()));
        let sig = hmac_sha256_hex("pp_secret", BODY).unwrap();
        let good = headers(PAYPAL_SIGNATURE_HEADER, &sig);
        assert!(verifier.verify(Provider::PayPal, &good, BODY).is_ok());

        let tampered = headers(PAYPAL_SIGNATURE_HEADER, &sig);
        assert_eq!(
            verifier.verify(Provider::PayPal, &tampered, br#"{"id":"evt_2"}"#),
            Err(VerifyError::InvalidSignature)
        );
    }
}
