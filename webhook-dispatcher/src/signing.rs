use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{DispatchError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const STANDARD_ID_HEADER: &str = "webhook-id";
pub const STANDARD_TIMESTAMP_HEADER: &str = "webhook-timestamp";
pub const STANDARD_SIGNATURE_HEADER: &str = "webhook-signature";

/// How an outbound body is signed when the webhook has a secret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureScheme {
    /// `X-Webhook-Signature: sha256=<hex>` over the raw body.
    #[default]
    #[serde(rename = "hmac-sha256")]
    HmacSha256,
    /// Standard Webhooks: `webhook-signature: v1,<base64>` over
    /// `<msg-id>.<timestamp>.<body>`.
    #[serde(rename = "standard-webhooks")]
    StandardWebhooks,
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| DispatchError::Signing(e.to_string()))
}

/// Standard Webhooks secrets are usually `whsec_<base64>`; anything that
/// does not decode is used as raw bytes.
fn standard_secret_bytes(secret: &str) -> Vec<u8> {
    let encoded = secret.strip_prefix("whsec_").unwrap_or(secret);
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap_or_else(|_| secret.as_bytes().to_vec())
}

pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = new_mac(secret.as_bytes())?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

pub fn sign_standard_webhooks(
    secret: &str,
    msg_id: &str,
    timestamp: i64,
    body: &[u8],
) -> Result<String> {
    let mut mac = new_mac(&standard_secret_bytes(secret))?;
    mac.update(format!("{msg_id}.{timestamp}.").as_bytes());
    mac.update(body);
    let encoded = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!("v1,{encoded}"))
}

/// Headers to attach for `scheme`. `msg_id` and `timestamp` must be the
/// same values sent elsewhere in the request.
pub fn signature_headers(
    scheme: SignatureScheme,
    secret: &str,
    msg_id: &str,
    timestamp: i64,
    body: &[u8],
) -> Result<Vec<(String, String)>> {
    match scheme {
        SignatureScheme::HmacSha256 => Ok(vec![(
            SIGNATURE_HEADER.to_string(),
            sign_hmac_sha256(secret, body)?,
        )]),
        SignatureScheme::StandardWebhooks => Ok(vec![
            (STANDARD_ID_HEADER.to_string(), msg_id.to_string()),
            (STANDARD_TIMESTAMP_HEADER.to_string(), timestamp.to_string()),
            (
                STANDARD_SIGNATURE_HEADER.to_string(),
                sign_standard_webhooks(secret, msg_id, timestamp, body)?,
            ),
        ]),
    }
}

/// Verify an `X-Webhook-Signature` value of the form `sha256=<hex>`.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let expected = match signature_header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    {
        Some(bytes) => bytes,
        None => return false,
    };

    let mut mac = match new_mac(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify a Standard Webhooks signature header, which may carry several
/// space-separated signatures.
pub fn verify_standard_webhooks(
    secret: &str,
    body: &[u8],
    msg_id: &str,
    timestamp: &str,
    signature_header: &str,
) -> bool {
    let mut mac = match new_mac(&standard_secret_bytes(secret)) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(format!("{msg_id}.{timestamp}.").as_bytes());
    mac.update(body);

    signature_header
        .split_whitespace()
        .filter_map(|sig| sig.strip_prefix("v1,"))
        .filter_map(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"event":"deal.won","payload":{"id":"d1"}}"#;

    #[test]
    fn hmac_signature_verifies() {
        let sig = sign_hmac_sha256("s3cret", BODY).unwrap();
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
        assert!(verify_hmac_sha256("s3cret", BODY, &sig));
    }

    #[test]
    fn hmac_rejects_tampering() {
        let sig = sign_hmac_sha256("s3cret", BODY).unwrap();
        assert!(!verify_hmac_sha256("other", BODY, &sig));
        assert!(!verify_hmac_sha256("s3cret", b"{}", &sig));
        assert!(!verify_hmac_sha256("s3cret", BODY, sig.trim_start_matches("sha256=")));
        assert!(!verify_hmac_sha256("s3cret", BODY, "sha256=zz"));
    }

    #[test]
    fn hmac_is_deterministic() {
        assert_eq!(
            sign_hmac_sha256("k", BODY).unwrap(),
            sign_hmac_sha256("k", BODY).unwrap()
        );
        assert_ne!(
            sign_hmac_sha256("k", BODY).unwrap(),
            sign_hmac_sha256("k2", BODY).unwrap()
        );
    }

    #[test]
    fn standard_webhooks_signature_verifies() {
        let secret = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";
        let sig = sign_standard_webhooks(secret, "msg_1", 1_700_000_000, BODY).unwrap();
        assert!(sig.starts_with("v1,"));
        assert!(verify_standard_webhooks(secret, BODY, "msg_1", "1700000000", &sig));
        assert!(!verify_standard_webhooks(secret, BODY, "msg_2", "1700000000", &sig));
        assert!(!verify_standard_webhooks(secret, BODY, "msg_1", "1700000001", &sig));
    }

    #[test]
    fn standard_webhooks_accepts_any_listed_signature() {
        let sig = sign_standard_webhooks("raw-secret", "m", 42, BODY).unwrap();
        let header = format!("v1,bm9wZQ== {sig}");
        assert!(verify_standard_webhooks("raw-secret", BODY, "m", "42", &header));
    }

    #[test]
    fn standard_webhooks_rejects_malformed_entries() {
        let sig = sign_standard_webhooks("raw-secret", "m", 42, BODY).unwrap();
        let encoded = sig.trim_start_matches("v1,");
        assert!(!verify_standard_webhooks("raw-secret", BODY, "m", "42", encoded));
        assert!(!verify_standard_webhooks("raw-secret", BODY, "m", "42", &format!("v2,{encoded}")));
        assert!(!verify_standard_webhooks("raw-secret", BODY, "m", "42", "v1,not*base64"));
        assert!(!verify_standard_webhooks("raw-secret", BODY, "m", "42", ""));
    }

    #[test]
    fn headers_per_scheme() {
        let h = signature_headers(SignatureScheme::HmacSha256, "k", "m", 1, BODY).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].0, SIGNATURE_HEADER);

        let h = signature_headers(SignatureScheme::StandardWebhooks, "k", "m", 1, BODY).unwrap();
        let names: Vec<&str> = h.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            names,
            vec![STANDARD_ID_HEADER, STANDARD_TIMESTAMP_HEADER, STANDARD_SIGNATURE_HEADER]
        );
        assert_eq!(h[1].1, "1");
    }

    #[test]
    fn scheme_wire_names() {
        assert_eq!(
            serde_json::to_string(&SignatureScheme::HmacSha256).unwrap(),
            "\"hmac-sha256\""
        );
        let scheme: SignatureScheme = serde_json::from_str("\"standard-webhooks\"").unwrap();
        assert_eq!(scheme, SignatureScheme::StandardWebhooks);
    }
}
