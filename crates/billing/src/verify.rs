//! Webhook signature verification
//!
//! The provider signs `"{timestamp}.{raw_body}"` with HMAC-SHA256 keyed by the
//! endpoint's signing secret and sends `t=<unix>,v1=<hex>[,v1=<hex>...]` in the
//! `Stripe-Signature` header. More than one `v1` entry appears while a secret
//! is being rolled; any match passes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::events::{EventEnvelope, ProviderEvent};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("webhook secret not configured")]
    MissingSecret,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Authenticates and decodes inbound webhook bodies. Never touches storage.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: Option<String>, tolerance_secs: i64) -> Self {
        Self {
            secret,
            tolerance_secs,
        }
    }

    /// Verify against the current wall clock
    pub fn verify(&self, raw_body: &str, signature_header: &str) -> Result<ProviderEvent, VerificationError> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.verify_at(raw_body, signature_header, now)
    }

    /// Verify with an explicit clock, `now` in unix seconds
    pub fn verify_at(
        &self,
        raw_body: &str,
        signature_header: &str,
        now: i64,
    ) -> Result<ProviderEvent, VerificationError> {
        let secret = self.secret.as_deref().ok_or(VerificationError::MissingSecret)?;

        let (timestamp, signatures) = parse_signature_header(signature_header)?;

        if (now - timestamp).abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                tolerance_secs = self.tolerance_secs,
                "Webhook timestamp outside tolerance"
            );
            return Err(VerificationError::InvalidSignature);
        }

        let expected = compute_signature(secret, timestamp, raw_body)?;

        let matched = signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| provided.len() == expected.len() && bool::from(provided.ct_eq(&expected)))
                .unwrap_or(false)
        });

        if !matched {
            tracing::warn!(candidates = signatures.len(), "Webhook signature mismatch");
            return Err(VerificationError::InvalidSignature);
        }

        // Only decode after the body is authenticated
        let envelope: EventEnvelope = serde_json::from_str(raw_body)
            .map_err(|e| VerificationError::MalformedPayload(e.to_string()))?;

        ProviderEvent::from_envelope(envelope).map_err(|e| VerificationError::MalformedPayload(e.to_string()))
    }
}

/// Split `t=..,v1=..` into the timestamp and every v1 signature
fn parse_signature_header(header: &str) -> Result<(i64, Vec<&str>), VerificationError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(VerificationError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(VerificationError::InvalidSignature);
    }

    Ok((timestamp, signatures))
}

fn compute_signature(secret: &str, timestamp: i64, raw_body: &str) -> Result<Vec<u8>, VerificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| VerificationError::MissingSecret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a valid header for `raw_body`. Used by tests across the workspace.
pub fn sign_payload(secret: &str, timestamp: i64, raw_body: &str) -> String {
    let signature = compute_signature(secret, timestamp, raw_body)
        .map(hex::encode)
        .unwrap_or_default();
    format!("t={},v1={}", timestamp, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_717_200_000;

    fn body() -> String {
        serde_json::json!({
            "id": "evt_123",
            "type": "customer.created",
            "created": NOW,
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string()
    }

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(Some(SECRET.to_string()), 300)
    }

    #[test]
    fn test_valid_signature_verifies() {
        let body = body();
        let header = sign_payload(SECRET, NOW, &body);
        let event = verifier().verify_at(&body, &header, NOW + 10).unwrap();
        assert_eq!(event.id, "evt_123");
        assert_eq!(event.event_type, "customer.created");
    }

    #[test]
    fn test_tampered_body_rejected() {
        let body = body();
        let header = sign_payload(SECRET, NOW, &body);
        let tampered = body.replace("evt_123", "evt_999");
        assert_eq!(
            verifier().verify_at(&tampered, &header, NOW),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = body();
        let header = sign_payload("whsec_other", NOW, &body);
        assert_eq!(
            verifier().verify_at(&body, &header, NOW),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn test_replay_outside_tolerance_rejected() {
        let body = body();
        let header = sign_payload(SECRET, NOW, &body);
        assert_eq!(
            verifier().verify_at(&body, &header, NOW + 301),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let body = body();
        let valid = sign_payload(SECRET, NOW, &body);
        let valid_sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={}", NOW, "00".repeat(32), valid_sig);
        assert!(verifier().verify_at(&body, &header, NOW).is_ok());
    }

    #[test]
    fn test_missing_secret() {
        let body = body();
        let header = sign_payload(SECRET, NOW, &body);
        let verifier = WebhookVerifier::new(None, 300);
        assert_eq!(
            verifier.verify_at(&body, &header, NOW),
            Err(VerificationError::MissingSecret)
        );
    }

    #[test]
    fn test_header_without_signature_rejected() {
        assert_eq!(
            verifier().verify_at(&body(), &format!("t={}", NOW), NOW),
            Err(VerificationError::InvalidSignature)
        );
        assert_eq!(
            verifier().verify_at(&body(), "garbage", NOW),
            Err(VerificationError::InvalidSignature)
        );
    }

    #[test]
    fn test_malformed_body_after_valid_signature() {
        let body = "{not json";
        let header = sign_payload(SECRET, NOW, body);
        assert!(matches!(
            verifier().verify_at(body, &header, NOW),
            Err(VerificationError::MalformedPayload(_))
        ));
    }
}
