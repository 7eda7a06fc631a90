//! # Call Vocabulary: Statuses, Directions, Roles
//!
//! The closed sets of values shared by the registry, the orchestrator and the
//! presence hub. Every enum serializes to the same kebab-case string that is
//! stored in PostgreSQL `TEXT` columns and sent over the socket channel, so a
//! value read from any of the three places round-trips without translation.
//!
//! ## Call state machine
//!
//! ```text
//! initiated ──> ringing ──> in-progress ──> completed
//!     │            │             │          busy
//!     └────────────┴─────────────┴───────>  no-answer
//!                                           failed
//!                                           canceled
//!                                           voicemail
//! ```
//!
//! The three left-hand states are transient; the six outcomes are terminal.

use serde::{Deserialize, Serialize};

/// A stored or received string that does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Implements `as_str`, `Display`, `FromStr` and `TryFrom<String>` for a
/// fieldless enum whose wire form is a fixed string per variant.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $ty {
            type Error = UnknownVariant;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

/// Internal call status. See the module docs for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Canceled,
    Voicemail,
}

string_enum!(CallStatus, "call status", {
    Initiated => "initiated",
    Ringing => "ringing",
    InProgress => "in-progress",
    Completed => "completed",
    Busy => "busy",
    NoAnswer => "no-answer",
    Failed => "failed",
    Canceled => "canceled",
    Voicemail => "voicemail",
});

impl CallStatus {
    /// Terminal statuses admit no further transient transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            CallStatus::Initiated | CallStatus::Ringing | CallStatus::InProgress
        )
    }

    /// Position along the transient path. All terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            CallStatus::Initiated => 0,
            CallStatus::Ringing => 1,
            CallStatus::InProgress => 2,
            _ => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

string_enum!(CallDirection, "call direction", {
    Inbound => "inbound",
    Outbound => "outbound",
});

impl CallDirection {
    /// Twilio reports `inbound`, `outbound-api` and `outbound-dial`.
    pub fn from_provider(direction: &str) -> Self {
        if direction.starts_with("outbound") {
            CallDirection::Outbound
        } else {
            CallDirection::Inbound
        }
    }
}

/// Outcome classification chosen by the agent, independent of `CallStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Connected,
    LeftVoicemail,
    NoAnswer,
    Busy,
    WrongNumber,
    CallbackRequested,
    NotInterested,
    Interested,
    Other,
}

string_enum!(Disposition, "disposition", {
    Connected => "connected",
    LeftVoicemail => "left-voicemail",
    NoAnswer => "no-answer",
    Busy => "busy",
    WrongNumber => "wrong-number",
    CallbackRequested => "callback-requested",
    NotInterested => "not-interested",
    Interested => "interested",
    Other => "other",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Caller,
    Callee,
    Transfer,
    Conference,
}

string_enum!(ParticipantRole, "participant role", {
    Caller => "caller",
    Callee => "callee",
    Transfer => "transfer",
    Conference => "conference",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingStatus {
    Processing,
    Completed,
    Failed,
    Deleted,
}

string_enum!(RecordingStatus, "recording status", {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Deleted => "deleted",
});

impl RecordingStatus {
    /// Twilio's `RecordingStatus` callback values: `in-progress`, `completed`,
    /// `absent`, `failed`. Absent recordings never produce audio.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "completed" => RecordingStatus::Completed,
            "absent" | "failed" => RecordingStatus::Failed,
            "deleted" => RecordingStatus::Deleted,
            _ => RecordingStatus::Processing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranscriptionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(TranscriptionStatus, "transcription status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl TranscriptionStatus {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "completed" => TranscriptionStatus::Completed,
            "failed" => TranscriptionStatus::Failed,
            "in-progress" => TranscriptionStatus::Processing,
            _ => TranscriptionStatus::Pending,
        }
    }
}
