//! Inbound interaction signing.
//!
//! Every request to the interactions endpoint carries an HMAC-SHA256
//! signature over `timestamp || body` plus the timestamp itself. The
//! verification is constant-time and happens before any body parsing;
//! stale timestamps are rejected to bound replay.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between signer and server.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

/// Verify `signature_hex` over `timestamp || body` with the shared
/// secret (hex-encoded). Returns false on any malformed input.
pub fn verify_signature(
    secret_hex: &str,
    timestamp: &str,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    let Ok(secret) = hex::decode(secret_hex.trim()) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(&secret) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// True when the signed timestamp is within the accepted skew of now.
pub fn timestamp_fresh(timestamp: &str, now_unix: i64) -> bool {
    let Ok(signed) = timestamp.trim().parse::<i64>() else {
        return false;
    };
    (now_unix - signed).abs() <= MAX_TIMESTAMP_SKEW_SECS
}

/// Produce a signature for tests and local tooling.
pub fn sign(secret_hex: &str, timestamp: &str, body: &[u8]) -> Option<String> {
    let secret = hex::decode(secret_hex.trim()).ok()?;
    let mut mac = HmacSha256::new_from_slice(&secret).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}
