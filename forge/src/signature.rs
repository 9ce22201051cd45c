//! Webhook signature verification (§6.3): HMAC-SHA-256 over the raw body,
//! compared against the `X-Hub-Signature-256: sha256=<hex>` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Returns `true` iff `header_value` is a well-formed `sha256=<hex>` signature
/// matching `HMAC-SHA256(secret, body)`. Any malformed input is rejected, not panicked on.
pub fn verify(secret: &[u8], body: &[u8], header_value: &str) -> bool {
    let Some(hex_sig) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(given) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&given).is_ok()
}

/// Computes the header value a caller would send, used by tests and by any
/// internal re-signing (e.g. forwarding webhooks).
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_signature() {
        let secret = b"shh";
        let body = b"{\"hello\":\"world\"}";
        let header = sign(secret, body);
        assert!(verify(secret, body, &header));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = b"{\"hello\":\"world\"}";
        let header = sign(b"shh", body);
        assert!(!verify(b"other", body, &header));
    }

    #[test]
    fn rejects_tampered_body() {
        let secret = b"shh";
        let header = sign(secret, b"{\"hello\":\"world\"}");
        assert!(!verify(secret, b"{\"hello\":\"mars\"}", &header));
    }

    #[test]
    fn rejects_missing_prefix() {
        let secret = b"shh";
        let body = b"payload";
        let bare_hex = hex::encode(b"not-a-real-mac-but-same-length-ish");
        assert!(!verify(secret, body, &bare_hex));
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(!verify(b"shh", b"payload", "sha256=not-hex"));
    }
}
