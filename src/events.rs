//! # Events: Call Notifications
//!
//! Domain notifications the orchestrator emits after a registry write. The
//! presence hub turns them into socket frames; tests capture them with
//! [`RecordingNotifier`].
//!
//! | Variant | Emitted When | Hub delivery |
//! |---------|-------------|--------------|
//! | `Incoming` | A fresh inbound call is recorded | all clients, pending map entry |
//! | `StatusChanged` | Any applied status transition | call room, then everyone else |
//! | `Started` | An outbound call is placed | all clients |
//! | `Ended` | A call reaches a terminal status | all clients, busy agents reset |
//! | `RecordingReady` | A completed recording is stored | all clients |
//!
//! Delivery is fire-and-forget: `notify` never blocks and never fails the
//! operation that produced the event.

use crate::call::{CallDirection, CallStatus};
use crate::lock_or_recover;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum CallNotification {
    Incoming {
        call_id: Uuid,
        provider_call_id: Option<String>,
        from_number: String,
        to_number: String,
        contact_id: Option<i64>,
        contact_name: Option<String>,
        created_at: DateTime<Utc>,
    },
    StatusChanged {
        call_id: Uuid,
        provider_call_id: Option<String>,
        status: CallStatus,
        duration_secs: Option<i32>,
    },
    Started {
        call_id: Uuid,
        user_id: String,
        direction: CallDirection,
        to_number: String,
    },
    Ended {
        call_id: Uuid,
        status: CallStatus,
        duration_secs: Option<i32>,
    },
    RecordingReady {
        call_id: Uuid,
        recording_id: String,
        url: String,
        duration_secs: Option<i32>,
    },
}

impl CallNotification {
    pub fn call_id(&self) -> Uuid {
        match self {
            CallNotification::Incoming { call_id, .. }
            | CallNotification::StatusChanged { call_id, .. }
            | CallNotification::Started { call_id, .. }
            | CallNotification::Ended { call_id, .. }
            | CallNotification::RecordingReady { call_id, .. } => *call_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CallNotification::Incoming { .. } => "incoming",
            CallNotification::StatusChanged { .. } => "status-changed",
            CallNotification::Started { .. } => "started",
            CallNotification::Ended { .. } => "ended",
            CallNotification::RecordingReady { .. } => "recording-ready",
        }
    }
}

/// Sink for call notifications.
pub trait CallNotifier: Send + Sync {
    fn notify(&self, notification: CallNotification);
}

/// Discards everything. For wiring without a hub.
pub struct NullNotifier;

impl CallNotifier for NullNotifier {
    fn notify(&self, _notification: CallNotification) {}
}

const RECENT_NOTIFICATIONS_CAP: usize = 200;

/// Keeps the most recent notifications in a bounded buffer.
#[derive(Default)]
pub struct RecordingNotifier {
    recent: Mutex<VecDeque<CallNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oldest first.
    pub fn all(&self) -> Vec<CallNotification> {
        lock_or_recover(&self.recent).iter().cloned().collect()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        lock_or_recover(&self.recent).iter().map(|n| n.kind()).collect()
    }

    pub fn clear(&self) {
        lock_or_recover(&self.recent).clear();
    }
}

impl CallNotifier for RecordingNotifier {
    fn notify(&self, notification: CallNotification) {
        let mut recent = lock_or_recover(&self.recent);
        if recent.len() >= RECENT_NOTIFICATIONS_CAP {
            recent.pop_front();
        }
        recent.push_back(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ended(id: Uuid) -> CallNotification {
        CallNotification::Ended {
            call_id: id,
            status: CallStatus::Completed,
            duration_secs: Some(3),
        }
    }

    #[test]
    fn new_recorder_is_empty() {
        assert!(RecordingNotifier::new().all().is_empty());
    }

    #[test]
    fn recorder_keeps_order() {
        let rec = RecordingNotifier::new();
        let id = Uuid::new_v4();
        rec.notify(CallNotification::StatusChanged {
            call_id: id,
            provider_call_id: None,
            status: CallStatus::Completed,
            duration_secs: None,
        });
        rec.notify(ended(id));
        assert_eq!(rec.kinds(), vec!["status-changed", "ended"]);
        assert!(rec.all().iter().all(|n| n.call_id() == id));
    }

    #[test]
    fn recorder_capped_at_200() {
        let rec = RecordingNotifier::new();
        let first = Uuid::new_v4();
        rec.notify(ended(first));
        for _ in 0..RECENT_NOTIFICATIONS_CAP {
            rec.notify(ended(Uuid::new_v4()));
        }
        let all = rec.all();
        assert_eq!(all.len(), RECENT_NOTIFICATIONS_CAP);
        assert!(all.iter().all(|n| n.call_id() != first));
    }

    #[test]
    fn serializes_with_kind_tag_and_camel_case_fields() {
        let id = Uuid::nil();
        let json = serde_json::to_value(ended(id)).unwrap();
        assert_eq!(json["kind"], "ended");
        assert_eq!(json["durationSecs"], 3);
        assert_eq!(json["callId"], id.to_string());
    }
}
