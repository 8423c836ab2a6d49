//! Stateless JWT expiry inspection. No signature checks; the proxy only
//! needs to know whether the upstream will still accept the token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;

fn decode_payload(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;

    if parts.next().is_none() {
        return None;
    }

    let padding = (4 - payload.len() % 4) % 4;
    let padded = format!("{payload}{}", "=".repeat(padding));
    let bytes = base64::engine::general_purpose::URL_SAFE.decode(padded).ok()?;

    serde_json::from_slice(&bytes).ok()
}

/// Expiry timestamp (unix seconds) claimed by the token, if any.
pub(crate) fn expires_at(token: &str) -> Option<u64> {
    decode_payload(token)?.get("exp")?.as_u64()
}

/// Whether the token expires within the buffer. Tokens without a readable
/// `exp` claim count as expired.
pub fn is_token_expired(token: &str, buffer: Duration) -> bool {
    let Some(exp) = expires_at(token) else {
        return true;
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    exp.saturating_sub(now) <= buffer.as_secs()
}
