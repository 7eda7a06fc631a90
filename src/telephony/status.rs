//! Provider call status vocabulary and its mapping onto [`CallStatus`].

use crate::call::CallStatus;

/// Every `CallStatus` value Twilio documents for voice calls, plus `answered`
/// which arrives as a `StatusCallbackEvent`. Anything else parses to `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCallStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Answered,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
    Unknown(String),
}

impl ProviderCallStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => ProviderCallStatus::Queued,
            "initiated" => ProviderCallStatus::Initiated,
            "ringing" => ProviderCallStatus::Ringing,
            "in-progress" => ProviderCallStatus::InProgress,
            "answered" => ProviderCallStatus::Answered,
            "completed" => ProviderCallStatus::Completed,
            "busy" => ProviderCallStatus::Busy,
            "no-answer" => ProviderCallStatus::NoAnswer,
            "failed" => ProviderCallStatus::Failed,
            "canceled" => ProviderCallStatus::Canceled,
            other => ProviderCallStatus::Unknown(other.to_string()),
        }
    }

    pub fn to_call_status(&self) -> CallStatus {
        match self {
            ProviderCallStatus::Queued | ProviderCallStatus::Initiated => CallStatus::Initiated,
            ProviderCallStatus::Ringing => CallStatus::Ringing,
            ProviderCallStatus::InProgress | ProviderCallStatus::Answered => CallStatus::InProgress,
            ProviderCallStatus::Completed => CallStatus::Completed,
            ProviderCallStatus::Busy => CallStatus::Busy,
            ProviderCallStatus::NoAnswer => CallStatus::NoAnswer,
            ProviderCallStatus::Failed => CallStatus::Failed,
            ProviderCallStatus::Canceled => CallStatus::Canceled,
            // Dropping an event loses more than recording it as failed.
            ProviderCallStatus::Unknown(_) => CallStatus::Failed,
        }
    }
}

/// Total mapping from a raw provider status string to an internal status.
pub fn map_twilio_status(provider_status: &str) -> CallStatus {
    ProviderCallStatus::parse(provider_status).to_call_status()
}
