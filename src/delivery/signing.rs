//! HMAC-SHA256 request signing.
//!
//! The signature covers the exact body bytes sent on the wire and is carried
//! as `X-Webhook-Signature: sha256=<hex>`.

use ring::hmac;

/// Prefix of the signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Sign `body` with `secret`, producing the full header value.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("{SIGNATURE_PREFIX}{}", hex::encode(tag.as_ref()))
}

/// Check a signature header against `body` in constant time.
///
/// Returns false for a missing prefix or malformed hex.
pub fn verify(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_sig) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_sig) else {
        return false;
    };
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &signature).is_ok()
}
