use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing timestamp")]
    MissingTimestamp,
    #[error("signature header missing v1 signature")]
    MissingSignature,
    #[error("signature timestamp outside tolerance")]
    Stale,
    #[error("signature does not match payload")]
    Mismatch,
}

/// key: billing-signature -> shared-secret webhook verification
///
/// The header carries `t=<unix seconds>,v1=<hex hmac>` pairs; the MAC covers
/// `"{t}.{raw body}"` keyed with the endpoint secret. Several `v1` entries may
/// be present while secrets rotate; any match is accepted.
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

    pub fn from_config() -> Self {
        Self::new(
            crate::config::STRIPE_WEBHOOK_SECRET.as_str(),
            *crate::config::STRIPE_WEBHOOK_TOLERANCE_SECS,
        )
    }

    pub fn verify(&self, header: &str, payload: &[u8], now: i64) -> Result<(), SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if candidates.is_empty() {
            return Err(SignatureError::MissingSignature);
        }
        let age = now.checked_sub(timestamp).map(i64::unsigned_abs);
        if !matches!(age, Some(age) if age <= self.tolerance_secs.unsigned_abs()) {
            return Err(SignatureError::Stale);
        }

        let matched = candidates.into_iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            self.mac(timestamp, payload).verify_slice(&expected).is_ok()
        });
        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }

    /// Computes the header value for `payload` at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let digest = self.mac(timestamp, payload).finalize().into_bytes();
        format!("t={timestamp},v1={}", hex::encode(digest))
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can use any key length");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_760_000_000;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new("whsec_test", 300)
    }

    #[test]
    fn accepts_signed_payload() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, NOW);
        assert_eq!(verifier().verify(&header, payload, NOW + 10), Ok(()));
    }

    #[test]
    fn accepts_any_rotated_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let good = verifier().sign(payload, NOW);
        let v1 = good.split_once(",v1=").unwrap().1;
        let header = format!("t={NOW},v1=deadbeef,v0=ignored,v1={v1}");
        assert_eq!(verifier().verify(&header, payload, NOW), Ok(()));
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = verifier().sign(br#"{"id":"evt_1"}"#, NOW);
        assert_eq!(
            verifier().verify(&header, br#"{"id":"evt_2"}"#, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_other_secret() {
        let payload = b"{}";
        let header = WebhookVerifier::new("whsec_other", 300).sign(payload, NOW);
        assert_eq!(
            verifier().verify(&header, payload, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = b"{}";
        let header = verifier().sign(payload, NOW - 600);
        assert_eq!(
            verifier().verify(&header, payload, NOW),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn extreme_timestamps_are_stale() {
        for header in [
            format!("t={},v1=00", i64::MIN),
            format!("t={},v1=00", i64::MAX),
        ] {
            assert_eq!(
                verifier().verify(&header, b"{}", NOW),
                Err(SignatureError::Stale)
            );
        }
        assert_eq!(
            verifier().verify("t=0,v1=00", b"{}", i64::MIN),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn rejects_incomplete_headers() {
        assert_eq!(
            verifier().verify("v1=abcd", b"{}", NOW),
            Err(SignatureError::MissingTimestamp)
        );
        assert_eq!(
            verifier().verify(&format!("t={NOW}"), b"{}", NOW),
            Err(SignatureError::MissingSignature)
        );
        assert_eq!(
            verifier().verify(&format!("t={NOW},v1=not-hex"), b"{}", NOW),
            Err(SignatureError::Mismatch)
        );
    }
}
