//! Webhook signature verification.
//!
//! Providers sign the exact raw request body with HMAC-SHA256; signatures
//! arrive hex-encoded, lowercase. Rotation keeps the previous secret valid
//! for a grace window so providers can cut over without dropped events.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// How long a rotated-out secret keeps verifying.
pub const ROTATION_GRACE: Duration = Duration::hours(24);

pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_one(secret: &str, payload: &[u8], signature: &[u8]) -> bool {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.verify_slice(signature).is_ok()
}

/// Verify a hex signature against the active secret set.
///
/// `previous` only participates while the rotation grace window is open.
pub fn verify(
    payload: &[u8],
    provided_hex: &str,
    current: &str,
    previous: Option<&str>,
    rotated_at: Option<DateTime<Utc>>,
) -> bool {
    let provided = provided_hex.trim();
    let provided = provided
        .strip_prefix("sha256=")
        .unwrap_or(provided);
    let Ok(signature) = hex::decode(provided) else {
        return false;
    };

    if verify_one(current, payload, &signature) {
        return true;
    }

    if let Some(previous) = previous {
        let within_grace = rotated_at
            .map(|at| Utc::now() - at <= ROTATION_GRACE)
            .unwrap_or(true);
        if within_grace && verify_one(previous, payload, &signature) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"event_id":"e1"}"#;
        let signature = sign("dev-web", body);
        assert!(verify(body, &signature, "dev-web", None, None));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = br#"{"event_id":"e1"}"#;
        let signature = sign("wrong", body);
        assert!(!verify(body, &signature, "dev-web", None, None));
    }

    #[test]
    fn sha256_prefix_is_accepted() {
        let body = b"payload";
        let signature = format!("sha256={}", sign("secret", body));
        assert!(verify(body, &signature, "secret", None, None));
    }

    #[test]
    fn previous_secret_verifies_within_grace() {
        let body = b"payload";
        let signature = sign("old-secret", body);
        let rotated_recently = Some(Utc::now() - Duration::hours(1));
        assert!(verify(
            body,
            &signature,
            "new-secret",
            Some("old-secret"),
            rotated_recently
        ));
    }

    #[test]
    fn previous_secret_expires_after_grace() {
        let body = b"payload";
        let signature = sign("old-secret", body);
        let rotated_long_ago = Some(Utc::now() - Duration::hours(48));
        assert!(!verify(
            body,
            &signature,
            "new-secret",
            Some("old-secret"),
            rotated_long_ago
        ));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(!verify(b"payload", "not-hex!", "secret", None, None));
        assert!(!verify(b"payload", "", "secret", None, None));
    }
}
