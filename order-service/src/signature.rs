//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`, where
//! each `v1` is HMAC-SHA256 over `"<t>.<raw body>"` keyed with the shared
//! secret. More than one `v1` appears while a secret is being rolled.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("malformed signature header: {0}")]
    MalformedHeader(&'static str),
    #[error("signature timestamp {timestamp} outside tolerance at {now}")]
    Expired { timestamp: i64, now: i64 },
    #[error("no signature matched the payload")]
    Mismatch,
    #[error("webhook secret is not a usable hmac key")]
    InvalidSecret,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> Result<(), SignatureError> {
        self.verify_at(payload, header, chrono::Utc::now().timestamp())
    }

    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut signatures: Vec<Vec<u8>> = Vec::new();

        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => {
                    timestamp = Some(
                        value
                            .parse()
                            .map_err(|_| SignatureError::MalformedHeader("timestamp is not an integer"))?,
                    )
                }
                // Undecodable entries are ignored like unknown schemes.
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        signatures.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader("missing timestamp"))?;
        if signatures.is_empty() {
            return Err(SignatureError::MalformedHeader("missing v1 signature"));
        }

        let within_tolerance = now
            .checked_sub(timestamp)
            .map(i64::unsigned_abs)
            .is_some_and(|skew| skew <= self.tolerance_secs.unsigned_abs());
        if !within_tolerance {
            return Err(SignatureError::Expired { timestamp, now });
        }

        let mac = self.mac_for(timestamp, payload)?;
        let matched = signatures
            .iter()
            .any(|signature| mac.clone().verify_slice(signature).is_ok());

        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Produces a header the processor would send for `payload` at `timestamp`.
    #[cfg(test)]
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> Result<String, SignatureError> {
        let digest = self.mac_for(timestamp, payload)?.finalize().into_bytes();
        Ok(format!("t={},v1={}", timestamp, hex::encode(digest)))
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, SignatureError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SignatureError::InvalidSecret)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;
    const BODY: &[u8] = br#"{"id":"evt_1","type":"payment_intent.succeeded"}"#;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new("whsec_test_secret", 300)
    }

    #[test]
    fn accepts_own_signature() {
        let v = verifier();
        let header = v.sign(BODY, NOW).unwrap();
        assert_eq!(v.verify_at(BODY, &header, NOW + 10), Ok(()));
    }

    #[test]
    fn rejects_tampered_body() {
        let v = verifier();
        let header = v.sign(BODY, NOW).unwrap();
        let tampered = br#"{"id":"evt_1","type":"payment_intent.canceled"}"#;
        assert_eq!(v.verify_at(tampered, &header, NOW), Err(SignatureError::Mismatch));
    }

    #[test]
    fn rejects_other_secret() {
        let header = WebhookVerifier::new("whsec_other", 300).sign(BODY, NOW).unwrap();
        assert_eq!(verifier().verify_at(BODY, &header, NOW), Err(SignatureError::Mismatch));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let v = verifier();
        let header = v.sign(BODY, NOW).unwrap();
        assert!(matches!(
            v.verify_at(BODY, &header, NOW + 301),
            Err(SignatureError::Expired { .. })
        ));
    }

    #[test]
    fn extreme_timestamps_are_expired_not_overflowed() {
        let v = verifier();
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1=00", t);
            assert!(matches!(
                v.verify_at(b"{}", &header, NOW),
                Err(SignatureError::Expired { .. })
            ));
        }
        assert!(matches!(
            v.verify_at(b"{}", "t=1,v1=00", i64::MIN),
            Err(SignatureError::Expired { .. })
        ));
    }

    #[test]
    fn accepts_any_matching_v1_during_rotation() {
        let v = verifier();
        let valid = v.sign(BODY, NOW).unwrap();
        let valid_sig = valid.split_once(",v1=").unwrap().1;
        let header = format!("t={},v1={},v1={}", NOW, "ab".repeat(32), valid_sig);
        assert_eq!(v.verify_at(BODY, &header, NOW), Ok(()));
    }

    #[test]
    fn rejects_malformed_headers() {
        let v = verifier();
        assert!(matches!(
            v.verify_at(BODY, "v1=deadbeef", NOW),
            Err(SignatureError::MalformedHeader(_))
        ));
        assert!(matches!(
            v.verify_at(BODY, &format!("t={}", NOW), NOW),
            Err(SignatureError::MalformedHeader(_))
        ));
        assert!(matches!(
            v.verify_at(BODY, "t=yesterday,v1=deadbeef", NOW),
            Err(SignatureError::MalformedHeader(_))
        ));
    }
}
