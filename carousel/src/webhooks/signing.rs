//! HMAC-SHA256 signing for Standard Webhooks compliance.
//!
//! The signature covers `{msg_id}.{timestamp}.{payload}`, is base64-encoded, and travels in the
//! `webhook-signature` header as `v1,{signature}` next to `webhook-id` and `webhook-timestamp`.
//!
//! See: <https://www.standardwebhooks.com/>

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Signs outgoing webhook bodies with a shared secret.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").finish_non_exhaustive()
    }
}

impl Signer {
    /// Build a signer from a `whsec_` prefixed, base64-encoded secret.
    ///
    /// Returns `None` if the prefix is missing or the remainder is not valid base64.
    pub fn from_secret(secret: &str) -> Option<Self> {
        let encoded = secret.strip_prefix(SECRET_PREFIX)?;
        let key = BASE64_STANDARD.decode(encoded).ok()?;
        if key.is_empty() {
            return None;
        }
        let mac = HmacSha256::new_from_slice(&key).ok()?;
        Some(Self { mac })
    }

    fn mac(&self, msg_id: &str, timestamp: i64, payload: &str) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(format!("{}.{}.{}", msg_id, timestamp, payload).as_bytes());
        mac
    }

    /// Signature header value, `v1,{base64-hmac-sha256}`.
    pub fn sign(&self, msg_id: &str, timestamp: i64, payload: &str) -> String {
        let signature = self.mac(msg_id, timestamp, payload).finalize().into_bytes();
        format!("v1,{}", BASE64_STANDARD.encode(signature))
    }

    /// Check a `webhook-signature` header. Accepts a space-separated list of signatures.
    pub fn verify(&self, msg_id: &str, timestamp: i64, payload: &str, header: &str) -> bool {
        header.split(' ').any(|candidate| {
            let Some(encoded) = candidate.strip_prefix("v1,") else {
                return false;
            };
            let Ok(signature) = BASE64_STANDARD.decode(encoded) else {
                return false;
            };
            // Constant-time comparison
            self.mac(msg_id, timestamp, payload)
                .verify_slice(&signature)
                .is_ok()
        })
    }

    /// The three Standard Webhooks headers for one delivery.
    pub fn headers(&self, msg_id: &str, timestamp: i64, payload: &str) -> Vec<(String, String)> {
        vec![
            ("webhook-id".to_string(), msg_id.to_string()),
            ("webhook-timestamp".to_string(), timestamp.to_string()),
            (
                "webhook-signature".to_string(),
                self.sign(msg_id, timestamp, payload),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> String {
        format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode([7u8; 32]))
    }

    #[test]
    fn test_rejects_bad_secrets() {
        assert!(Signer::from_secret("invalid_secret").is_none());
        assert!(Signer::from_secret("whsec_not-valid-base64!!!").is_none());
        assert!(Signer::from_secret("whsec_").is_none());
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = Signer::from_secret(&secret()).unwrap();
        let timestamp = 1704067200;
        let payload = r#"{"type":"batch.completed"}"#;

        let signature = signer.sign("msg_1", timestamp, payload);
        assert!(signature.starts_with("v1,"));
        assert!(signer.verify("msg_1", timestamp, payload, &signature));

        assert!(!signer.verify("msg_1", timestamp, "tampered", &signature));
        assert!(!signer.verify("msg_2", timestamp, payload, &signature));
        assert!(!signer.verify("msg_1", timestamp + 1, payload, &signature));
        assert!(!signer.verify("msg_1", timestamp, payload, "v1,AAAA"));
    }

    #[test]
    fn test_verify_accepts_rotated_signature_lists() {
        let signer = Signer::from_secret(&secret()).unwrap();
        let signature = signer.sign("msg", 1, "{}");
        let header = format!("v1,b2xk {}", signature);
        assert!(signer.verify("msg", 1, "{}", &header));
    }

    #[test]
    fn test_headers() {
        let signer = Signer::from_secret(&secret()).unwrap();
        let headers = signer.headers("msg", 42, "{}");
        let names: Vec<_> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["webhook-id", "webhook-timestamp", "webhook-signature"]
        );
        assert_eq!(headers[1].1, "42");
    }
}
