//! Signaling helpers: URL normalization and hello authentication

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// Normalize a configured signaling URL into the WebSocket endpoint:
/// `http`→`ws`, `https`→`wss`, and the `/spreed` path suffix ensured.
pub fn sanitize_websocket_url(url: &str) -> String {
    let url = if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        url.to_string()
    };

    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/spreed") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/spreed")
    }
}

/// Lowercase hex HMAC-SHA256 of `message` under `key`, as the HPB expects
/// for internal-client authentication.
pub fn hmac_sha256_hex(key: &str, message: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// A 64-byte random nonce, URL-safe base64 encoded.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
