//! Agent presence and pending incoming calls.
//!
//! Plain data owned by the hub's dispatcher task, which is its only writer.
//! Readers get a [`PresenceSnapshot`] through a `watch` channel instead of
//! touching these maps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub user_id: String,
    pub email: Option<String>,
    pub status: AgentStatus,
    pub current_call_id: Option<Uuid>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl AgentPresence {
    /// Online and not already on a call.
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Online && self.current_call_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub call_id: Uuid,
    pub from_number: String,
    pub created_at: DateTime<Utc>,
    pub notified_agents: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    /// No pending entry: already accepted, ended, or never announced.
    NotPending,
    UnknownAgent,
}

/// Read-only view published after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub agents: Vec<AgentPresence>,
    pub pending_calls: Vec<Uuid>,
}

impl PresenceSnapshot {
    pub fn available_count(&self) -> usize {
        self.agents.iter().filter(|a| a.is_available()).count()
    }

    /// The available agent who has gone longest without activity.
    pub fn longest_idle_available(&self) -> Option<&AgentPresence> {
        self.agents
            .iter()
            .filter(|a| a.is_available())
            .min_by(|a, b| {
                a.last_activity
                    .cmp(&b.last_activity)
                    .then_with(|| a.user_id.cmp(&b.user_id))
            })
    }
}

#[derive(Default)]
pub struct Presence {
    agents: HashMap<String, AgentPresence>,
    pending: HashMap<Uuid, PendingCall>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection. Returns `true` for a user not already present; a
    /// second tab keeps the existing status.
    pub fn register(&mut self, user_id: &str, email: Option<String>, now: DateTime<Utc>) -> bool {
        if let Some(agent) = self.agents.get_mut(user_id) {
            agent.last_activity = now;
            return false;
        }
        self.agents.insert(
            user_id.to_string(),
            AgentPresence {
                user_id: user_id.to_string(),
                email,
                status: AgentStatus::Online,
                current_call_id: None,
                connected_at: now,
                last_activity: now,
            },
        );
        true
    }

    pub fn deregister(&mut self, user_id: &str) -> Option<AgentPresence> {
        self.agents.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&AgentPresence> {
        self.agents.get(user_id)
    }

    pub fn touch(&mut self, user_id: &str, now: DateTime<Utc>) {
        if let Some(agent) = self.agents.get_mut(user_id) {
            agent.last_activity = now;
        }
    }

    /// Self-reported availability. Going `online` clears any stale call.
    pub fn set_status(
        &mut self,
        user_id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Option<&AgentPresence> {
        let agent = self.agents.get_mut(user_id)?;
        agent.status = status;
        if status == AgentStatus::Online {
            agent.current_call_id = None;
        }
        agent.last_activity = now;
        Some(agent)
    }

    pub fn add_pending(&mut self, call_id: Uuid, from_number: &str, now: DateTime<Utc>) {
        self.pending.entry(call_id).or_insert_with(|| PendingCall {
            call_id,
            from_number: from_number.to_string(),
            created_at: now,
            notified_agents: HashSet::new(),
        });
    }

    pub fn pending(&self, call_id: &Uuid) -> Option<&PendingCall> {
        self.pending.get(call_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Take a pending call: the agent becomes busy on it and the entry is gone.
    pub fn accept(
        &mut self,
        user_id: &str,
        call_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<&AgentPresence, AcceptError> {
        if !self.agents.contains_key(user_id) {
            return Err(AcceptError::UnknownAgent);
        }
        if self.pending.remove(&call_id).is_none() {
            return Err(AcceptError::NotPending);
        }
        let agent = self
            .agents
            .get_mut(user_id)
            .ok_or(AcceptError::UnknownAgent)?;
        agent.status = AgentStatus::Busy;
        agent.current_call_id = Some(call_id);
        agent.last_activity = now;
        Ok(agent)
    }

    /// Note a rejection. No re-routing happens here.
    pub fn reject(&mut self, user_id: &str, call_id: Uuid) -> bool {
        match self.pending.get_mut(&call_id) {
            Some(pending) => {
                pending.notified_agents.insert(user_id.to_string());
                true
            }
            None => false,
        }
    }

    /// A call ended: drop its pending entry and put every agent on it back
    /// online. Returns the agents that were reset.
    pub fn release_call(&mut self, call_id: Uuid, now: DateTime<Utc>) -> Vec<AgentPresence> {
        self.pending.remove(&call_id);
        let mut released: Vec<AgentPresence> = self
            .agents
            .values_mut()
            .filter(|a| a.current_call_id == Some(call_id))
            .map(|a| {
                a.current_call_id = None;
                a.status = AgentStatus::Online;
                a.last_activity = now;
                a.clone()
            })
            .collect();
        released.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        released
    }

    /// Forget pending calls nobody picked up within `max_age`.
    pub fn prune_pending(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| now - p.created_at < max_age);
        before - self.pending.len()
    }

    /// Connected agents ordered by user id.
    pub fn roster(&self) -> Vec<AgentPresence> {
        let mut agents: Vec<_> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        agents
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        let mut pending_calls: Vec<Uuid> = self.pending.keys().copied().collect();
        pending_calls.sort();
        PresenceSnapshot {
            agents: self.roster(),
            pending_calls,
        }
    }
}
