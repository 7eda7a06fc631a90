//! `X-Twilio-Signature` verification.
//!
//! Twilio signs the full request URL followed by every POST parameter, sorted
//! by name, with each name immediately followed by its value. The digest is
//! HMAC-SHA1 keyed with the account auth token, base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// The byte string Twilio signs for `url` and form `params`.
pub fn signing_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    let mut payload = String::from(url);
    for (key, value) in sorted {
        payload.push_str(key);
        payload.push_str(value);
    }
    payload
}

/// Base64 HMAC-SHA1 signature for a request.
pub fn compute_signature(auth_token: &str, url: &str, params: &[(String, String)]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha1::new_from_slice(auth_token.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(signing_payload(url, params).as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a received signature. Malformed base64 fails.
pub fn validate_signature(
    auth_token: &str,
    signature: &str,
    url: &str,
    params: &[(String, String)],
) -> bool {
    if auth_token.is_empty() {
        return false;
    }
    let Ok(expected) = STANDARD.decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha1::new_from_slice(auth_token.as_bytes()) else {
        return false;
    };
    mac.update(signing_payload(url, params).as_bytes());
    mac.verify_slice(&expected).is_ok()
}
