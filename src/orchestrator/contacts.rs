//! Contact resolution for inbound calls.

use crate::db::ContactMatch;
use anyhow::Result;
use async_trait::async_trait;

/// CRM lookup by E.164 phone number. No match is `Ok(None)`, not an error.
#[async_trait]
pub trait ContactLookup: Send + Sync {
    async fn find_by_phone(&self, e164: &str) -> Result<Option<ContactMatch>>;
}

/// Normalize a dialled or caller-id number to E.164.
///
/// Punctuation and spaces are dropped, a `00` international prefix becomes
/// `+`, and bare ten-digit numbers are taken as North American. Returns
/// `None` for strings without digits or that are client identities.
pub fn normalize_e164(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.starts_with("client:") || raw.starts_with("sip:") {
        return None;
    }
    let plus = raw.starts_with('+');
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let e164 = if plus {
        format!("+{}", digits)
    } else if let Some(rest) = digits.strip_prefix("00") {
        format!("+{}", rest)
    } else if digits.len() == 10 {
        format!("+1{}", digits)
    } else {
        format!("+{}", digits)
    };
    // E.164 allows at most 15 digits after the plus.
    (e164.len() > 2 && e164.len() <= 16).then_some(e164)
}
