//! Socket frames. Every frame is a JSON text message `{"event": "<name>", ...}`
//! with camelCase payload fields.

use crate::call::{CallDirection, CallStatus};
use crate::events::CallNotification;
use crate::presence::{AgentPresence, AgentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    #[serde(rename = "call:accept")]
    Accept { call_id: Uuid },
    #[serde(rename = "call:reject")]
    Reject { call_id: Uuid },
    #[serde(rename = "call:note")]
    Note { call_id: Uuid, note: String },
    #[serde(rename = "agent:status")]
    Status { status: AgentStatus },
    #[serde(rename = "call:join-room")]
    JoinRoom { call_id: Uuid },
    #[serde(rename = "call:leave-room")]
    LeaveRoom { call_id: Uuid },
    #[serde(rename = "agents:list")]
    ListAgents {},
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Accept { .. } => "call:accept",
            ClientEvent::Reject { .. } => "call:reject",
            ClientEvent::Note { .. } => "call:note",
            ClientEvent::Status { .. } => "agent:status",
            ClientEvent::JoinRoom { .. } => "call:join-room",
            ClientEvent::LeaveRoom { .. } => "call:leave-room",
            ClientEvent::ListAgents {} => "agents:list",
        }
    }
}

/// Frames the hub sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected { id: String },
    #[serde(rename = "call:accepted")]
    Accepted {
        call_id: Uuid,
        agent_id: String,
        accepted_at: DateTime<Utc>,
    },
    #[serde(rename = "call:note-added")]
    NoteAdded {
        call_id: Uuid,
        note: String,
        user_id: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename = "agent:status")]
    AgentStatus {
        user_id: String,
        status: AgentStatus,
        current_call_id: Option<Uuid>,
    },
    #[serde(rename = "agents:list")]
    Agents { agents: Vec<AgentPresence> },
    #[serde(rename = "call:incoming")]
    Incoming {
        call_id: Uuid,
        provider_call_id: Option<String>,
        from_number: String,
        to_number: String,
        contact_id: Option<i64>,
        contact_name: Option<String>,
        created_at: DateTime<Utc>,
    },
    #[serde(rename = "call:status")]
    Status {
        call_id: Uuid,
        provider_call_id: Option<String>,
        status: CallStatus,
        duration_secs: Option<i32>,
    },
    #[serde(rename = "call:started")]
    Started {
        call_id: Uuid,
        user_id: String,
        direction: CallDirection,
        to_number: String,
    },
    #[serde(rename = "call:ended")]
    Ended {
        call_id: Uuid,
        status: CallStatus,
        duration_secs: Option<i32>,
    },
    #[serde(rename = "call:recording-ready")]
    RecordingReady {
        call_id: Uuid,
        recording_id: String,
        url: String,
        duration_secs: Option<i32>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn agent_status(agent: &AgentPresence) -> Self {
        ServerEvent::AgentStatus {
            user_id: agent.user_id.clone(),
            status: agent.status,
            current_call_id: agent.current_call_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::Accepted { .. } => "call:accepted",
            ServerEvent::NoteAdded { .. } => "call:note-added",
            ServerEvent::AgentStatus { .. } => "agent:status",
            ServerEvent::Agents { .. } => "agents:list",
            ServerEvent::Incoming { .. } => "call:incoming",
            ServerEvent::Status { .. } => "call:status",
            ServerEvent::Started { .. } => "call:started",
            ServerEvent::Ended { .. } => "call:ended",
            ServerEvent::RecordingReady { .. } => "call:recording-ready",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl From<CallNotification> for ServerEvent {
    fn from(n: CallNotification) -> Self {
        match n {
            CallNotification::Incoming {
                call_id,
                provider_call_id,
                from_number,
                to_number,
                contact_id,
                contact_name,
                created_at,
            } => ServerEvent::Incoming {
                call_id,
                provider_call_id,
                from_number,
                to_number,
                contact_id,
                contact_name,
                created_at,
            },
            CallNotification::StatusChanged {
                call_id,
                provider_call_id,
                status,
                duration_secs,
            } => ServerEvent::Status {
                call_id,
                provider_call_id,
                status,
                duration_secs,
            },
            CallNotification::Started {
                call_id,
                user_id,
                direction,
                to_number,
            } => ServerEvent::Started {
                call_id,
                user_id,
                direction,
                to_number,
            },
            CallNotification::Ended {
                call_id,
                status,
                duration_secs,
            } => ServerEvent::Ended {
                call_id,
                status,
                duration_secs,
            },
            CallNotification::RecordingReady {
                call_id,
                recording_id,
                url,
                duration_secs,
            } => ServerEvent::RecordingReady {
                call_id,
                recording_id,
                url,
                duration_secs,
            },
        }
    }
}
