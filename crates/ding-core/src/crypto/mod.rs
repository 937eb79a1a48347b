//! HMAC signature helpers for webhook verification.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Computes HMAC-SHA1 of `body` with `key` and returns it as a lowercase
/// hex string, matching GitHub's legacy `X-Hub-Signature` scheme.
pub fn hmac_sha1_hex(key: &[u8], body: &[u8]) -> String {
    let mut mac = <HmacSha1 as Mac>::new_from_slice(key).expect("HMAC accepts a key of any size");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies GitHub's `X-Hub-Signature: sha1=<hex>` header against the raw
/// request body, using a constant-time comparison via [`Mac::verify_slice`].
pub fn verify_github_signature(secret: &str, signature_header: &str, body: &[u8]) -> bool {
    let Some(provided_hex) = signature_header.strip_prefix("sha1=") else {
        return false;
    };
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let mut mac = <HmacSha1 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts a key of any size");
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_matching_signature() {
        let secret = "topsecret";
        let body = b"{\"ref\":\"refs/heads/main\"}";
        let sig = format!("sha1={}", hmac_sha1_hex(secret.as_bytes(), body));
        assert!(verify_github_signature(secret, &sig, body));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = b"payload";
        let sig = format!("sha1={}", hmac_sha1_hex(b"right", body));
        assert!(!verify_github_signature("wrong", &sig, body));
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(!verify_github_signature("secret", "md5=deadbeef", b"body"));
        assert!(!verify_github_signature("secret", "sha1=not-hex", b"body"));
    }
}
