//! Webhook signature verification using HMAC-SHA1.
//!
//! The host signs webhook payloads with HMAC-SHA1 over the raw body using a
//! per-repository shared secret; the signature arrives in the
//! `X-Hub-Signature` header as `sha1=<hex>`. Verification happens before any
//! parsing, and secret material is never logged.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Parses a signature header (e.g. `"sha1=abc123..."`) into raw bytes.
///
/// Returns `None` for malformed headers (missing prefix, invalid hex).
/// Never panics.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha1=")?;
    hex::decode(hex_sig).ok()
}

/// Computes the HMAC-SHA1 signature of a payload using the given secret.
///
/// Exposed for tests and for CI providers that embed the HMAC in the body.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a host-style header value, `sha1=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha1={}", hex::encode(signature))
}

/// Verifies a webhook signature against the payload and secret.
///
/// Uses constant-time comparison via the HMAC library.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Verifies a bare hex HMAC (no `sha1=` prefix), as embedded by CI
/// providers that sign the rest of the body.
pub fn verify_hex_hmac(payload: &[u8], hex_hmac: &str, secret: &[u8]) -> bool {
    let Ok(expected) = hex::decode(hex_hmac) else {
        return false;
    };
    let mut mac = match HmacSha1::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
