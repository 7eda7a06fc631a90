//! # Hub: Real-Time Agent Presence and Call Notifications
//!
//! A single dispatcher task owns all presence state, the connection table and
//! the room memberships. Everything else talks to it through a bounded
//! command queue via [`HubHandle`]:
//!
//! ```text
//!  socket tasks ──Connect/Client/Disconnect──┐
//!                                            ├──> dispatcher ──try_send──> per-connection queues
//!  orchestrator ──Notify (try_send)──────────┘        │
//!                                                     ├──watch──> PresenceSnapshot (routing, /api/agents, metrics)
//!                                                     └──mpsc───> AgentAction (orchestrator)
//! ```
//!
//! The dispatcher never awaits. Frames go out with `try_send`, so a client
//! whose queue is full loses its own frames and nobody else waits on it.
//! When the command queue itself is full, `call:incoming` and `call:ended`
//! notifications wait for room in a spawned task; the others are dropped and
//! counted in `switchboard_hub_notifications_dropped`.
//!
//! ## Rooms
//!
//! `user:<id>` is joined on connect. `call:<id>` is joined on accept or
//! explicitly via `call:join-room`. Status frames go to the call room first,
//! then to everyone else, and each connection receives a frame once.

pub mod protocol;

use crate::events::{CallNotification, CallNotifier};
use crate::orchestrator::AgentAction;
use crate::presence::{AcceptError, AgentStatus, Presence, PresenceSnapshot};
use crate::prom_metrics::Metrics;
use chrono::Utc;
use protocol::{ClientEvent, ServerEvent};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnId = u64;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Commands queued for the dispatcher before senders wait.
    pub command_capacity: usize,
    /// Frames buffered per connection before new ones are dropped.
    pub outbound_capacity: usize,
    pub action_capacity: usize,
    /// Pending calls nobody accepted are forgotten after this long.
    pub pending_ttl_secs: i64,
    pub prune_interval_secs: u64,
    /// Owner and dial target for inbound calls when no agent is available.
    pub fallback_owner_id: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            command_capacity: 1024,
            outbound_capacity: 64,
            action_capacity: 256,
            pending_ttl_secs: 300,
            prune_interval_secs: 30,
            fallback_owner_id: "admin".to_string(),
        }
    }
}

#[derive(Debug)]
enum HubCommand {
    Connect {
        conn_id: ConnId,
        user_id: String,
        email: Option<String>,
        tx: mpsc::Sender<ServerEvent>,
    },
    Disconnect {
        conn_id: ConnId,
    },
    Client {
        conn_id: ConnId,
        event: ClientEvent,
    },
    Notify(CallNotification),
}

/// A registered socket: its id and the queue the dispatcher writes to.
pub struct HubConnection {
    pub id: ConnId,
    pub rx: mpsc::Receiver<ServerEvent>,
}

/// Cheap, cloneable access to the hub.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    presence: watch::Receiver<PresenceSnapshot>,
    next_conn: Arc<AtomicU64>,
    outbound_capacity: usize,
    metrics: Arc<Metrics>,
}

impl HubHandle {
    /// Register a connection for `user_id`. `None` if the hub has stopped.
    pub async fn connect(&self, user_id: &str, email: Option<String>) -> Option<HubConnection> {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        self.commands
            .send(HubCommand::Connect {
                conn_id,
                user_id: user_id.to_string(),
                email,
                tx,
            })
            .await
            .ok()?;
        Some(HubConnection { id: conn_id, rx })
    }

    pub async fn disconnect(&self, conn_id: ConnId) {
        if self
            .commands
            .send(HubCommand::Disconnect { conn_id })
            .await
            .is_err()
        {
            debug!(conn_id, "hub stopped before disconnect");
        }
    }

    pub async fn client_event(&self, conn_id: ConnId, event: ClientEvent) {
        if self
            .commands
            .send(HubCommand::Client { conn_id, event })
            .await
            .is_err()
        {
            debug!(conn_id, "hub stopped, client event dropped");
        }
    }

    pub fn presence(&self) -> watch::Receiver<PresenceSnapshot> {
        self.presence.clone()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.presence.borrow().clone()
    }
}

/// Notifications that add or clear presence state. Losing one would leave a
/// pending call or a busy agent behind.
fn carries_presence_state(notification: &CallNotification) -> bool {
    matches!(
        notification,
        CallNotification::Incoming { .. } | CallNotification::Ended { .. }
    )
}

impl CallNotifier for HubHandle {
    fn notify(&self, notification: CallNotification) {
        let kind = notification.kind();
        match self.commands.try_send(HubCommand::Notify(notification)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(HubCommand::Notify(notification)))
                if carries_presence_state(&notification) =>
            {
                debug!(kind, "hub queue full, delivering in background");
                let commands = self.commands.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    if commands.send(HubCommand::Notify(notification)).await.is_err() {
                        metrics.record_notification_dropped(kind);
                    }
                });
            }
            Err(e) => {
                warn!(kind, error = %e, "hub queue unavailable, notification dropped");
                self.metrics.record_notification_dropped(kind);
            }
        }
    }
}

/// Start the dispatcher. The returned receiver carries agent actions for the
/// orchestrator.
pub fn spawn(config: HubConfig, metrics: Arc<Metrics>) -> (HubHandle, mpsc::Receiver<AgentAction>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
    let (action_tx, action_rx) = mpsc::channel(config.action_capacity.max(1));
    let (snapshot_tx, snapshot_rx) = watch::channel(PresenceSnapshot::default());
    let handle = HubHandle {
        commands: cmd_tx,
        presence: snapshot_rx,
        next_conn: Arc::new(AtomicU64::new(0)),
        outbound_capacity: config.outbound_capacity.max(1),
        metrics: metrics.clone(),
    };
    let hub = Hub {
        presence: Presence::new(),
        connections: HashMap::new(),
        rooms: HashMap::new(),
        snapshot_tx,
        actions: action_tx,
        metrics,
        config,
    };
    tokio::spawn(hub.run(cmd_rx));
    (handle, action_rx)
}

struct Connection {
    user_id: String,
    tx: mpsc::Sender<ServerEvent>,
}

struct Hub {
    presence: Presence,
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<String, HashSet<ConnId>>,
    snapshot_tx: watch::Sender<PresenceSnapshot>,
    actions: mpsc::Sender<AgentAction>,
    metrics: Arc<Metrics>,
    config: HubConfig,
}

fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn call_room(call_id: Uuid) -> String {
    format!("call:{}", call_id)
}

impl Hub {
    async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        let mut prune = tokio::time::interval(Duration::from_secs(self.config.prune_interval_secs.max(1)));
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        prune.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = prune.tick() => {
                    let dropped = self
                        .presence
                        .prune_pending(chrono::Duration::seconds(self.config.pending_ttl_secs), Utc::now());
                    if dropped > 0 {
                        info!(dropped, "expired unaccepted pending calls");
                        self.publish();
                    }
                }
            }
        }
        info!("hub dispatcher stopped");
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect {
                conn_id,
                user_id,
                email,
                tx,
            } => self.on_connect(conn_id, user_id, email, tx),
            HubCommand::Disconnect { conn_id } => self.on_disconnect(conn_id),
            HubCommand::Client { conn_id, event } => self.on_client(conn_id, event),
            HubCommand::Notify(n) => self.on_notification(n),
        }
        self.publish();
    }

    fn on_connect(
        &mut self,
        conn_id: ConnId,
        user_id: String,
        email: Option<String>,
        tx: mpsc::Sender<ServerEvent>,
    ) {
        let first = self.presence.register(&user_id, email, Utc::now());
        self.connections.insert(
            conn_id,
            Connection {
                user_id: user_id.clone(),
                tx,
            },
        );
        self.join(conn_id, user_room(&user_id));
        info!(conn_id, user_id = %user_id, first, "agent connected");

        self.deliver(conn_id, ServerEvent::Connected { id: user_id.clone() });
        if first {
            if let Some(agent) = self.presence.get(&user_id) {
                let frame = ServerEvent::agent_status(agent);
                self.broadcast_except_user(&user_id, frame);
            }
        }
    }

    fn on_disconnect(&mut self, conn_id: ConnId) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        self.rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
        let still_connected = self.connections.values().any(|c| c.user_id == conn.user_id);
        info!(conn_id, user_id = %conn.user_id, still_connected, "agent disconnected");
        if still_connected {
            return;
        }
        if let Some(agent) = self.presence.deregister(&conn.user_id) {
            if let Some(call_id) = agent.current_call_id {
                debug!(user_id = %conn.user_id, call_id = %call_id, "agent left during a call");
            }
        }
        self.broadcast(ServerEvent::AgentStatus {
            user_id: conn.user_id,
            status: AgentStatus::Offline,
            current_call_id: None,
        });
    }

    fn on_client(&mut self, conn_id: ConnId, event: ClientEvent) {
        let Some(user_id) = self.connections.get(&conn_id).map(|c| c.user_id.clone()) else {
            debug!(conn_id, event = event.name(), "event from unknown connection");
            return;
        };
        let now = Utc::now();
        self.presence.touch(&user_id, now);

        match event {
            ClientEvent::Accept { call_id } => match self.presence.accept(&user_id, call_id, now) {
                Ok(agent) => {
                    let status = ServerEvent::agent_status(agent);
                    info!(user_id = %user_id, call_id = %call_id, "call accepted");
                    self.join(conn_id, call_room(call_id));
                    self.broadcast(ServerEvent::Accepted {
                        call_id,
                        agent_id: user_id.clone(),
                        accepted_at: now,
                    });
                    self.broadcast(status);
                    self.forward(AgentAction::Accepted {
                        call_id,
                        agent_id: user_id,
                    });
                }
                Err(AcceptError::NotPending) => {
                    info!(user_id = %user_id, call_id = %call_id, "accept for a call no longer pending");
                }
                Err(AcceptError::UnknownAgent) => {
                    warn!(user_id = %user_id, call_id = %call_id, "accept from agent without presence");
                }
            },
            ClientEvent::Reject { call_id } => {
                if self.presence.reject(&user_id, call_id) {
                    debug!(user_id = %user_id, call_id = %call_id, "call rejected");
                    self.forward(AgentAction::Rejected {
                        call_id,
                        agent_id: user_id,
                    });
                } else {
                    debug!(user_id = %user_id, call_id = %call_id, "reject for a call no longer pending");
                }
            }
            ClientEvent::Note { call_id, note } => {
                let frame = ServerEvent::NoteAdded {
                    call_id,
                    note: note.clone(),
                    user_id: user_id.clone(),
                    created_at: now,
                };
                let siblings: Vec<ConnId> = self
                    .room_members(&user_room(&user_id))
                    .into_iter()
                    .filter(|id| *id != conn_id)
                    .collect();
                for id in siblings {
                    self.deliver(id, frame.clone());
                }
                self.forward(AgentAction::Note {
                    call_id,
                    agent_id: user_id,
                    note,
                });
            }
            ClientEvent::Status { status } => {
                if let Some(agent) = self.presence.set_status(&user_id, status, now) {
                    let frame = ServerEvent::agent_status(agent);
                    debug!(user_id = %user_id, status = status.as_str(), "agent status set");
                    self.broadcast(frame);
                }
            }
            ClientEvent::JoinRoom { call_id } => self.join(conn_id, call_room(call_id)),
            ClientEvent::LeaveRoom { call_id } => self.leave(conn_id, &call_room(call_id)),
            ClientEvent::ListAgents {} => {
                let agents = self.presence.roster();
                self.deliver(conn_id, ServerEvent::Agents { agents });
            }
        }
    }

    fn on_notification(&mut self, notification: CallNotification) {
        let now = Utc::now();
        match notification {
            CallNotification::Incoming {
                call_id,
                ref from_number,
                ..
            } => {
                self.presence.add_pending(call_id, from_number, now);
                let available = self.presence.snapshot().available_count();
                if available == 0 {
                    warn!(call_id = %call_id, "incoming call with no available agents");
                } else {
                    info!(call_id = %call_id, available, "incoming call announced");
                }
                self.broadcast(notification.into());
            }
            CallNotification::StatusChanged { call_id, .. } => {
                let frame: ServerEvent = notification.into();
                let room = self.room_members(&call_room(call_id));
                for id in &room {
                    self.deliver(*id, frame.clone());
                }
                let rest: Vec<ConnId> = self
                    .connections
                    .keys()
                    .copied()
                    .filter(|id| !room.contains(id))
                    .collect();
                for id in rest {
                    self.deliver(id, frame.clone());
                }
            }
            CallNotification::Ended { call_id, .. } => {
                let released = self.presence.release_call(call_id, now);
                self.broadcast(notification.into());
                for agent in &released {
                    self.broadcast(ServerEvent::agent_status(agent));
                }
                self.rooms.remove(&call_room(call_id));
            }
            CallNotification::Started { .. } | CallNotification::RecordingReady { .. } => {
                self.broadcast(notification.into());
            }
        }
    }

    fn forward(&self, action: AgentAction) {
        if let Err(e) = self.actions.try_send(action) {
            warn!(error = %e, "agent action dropped");
        }
    }

    fn join(&mut self, conn_id: ConnId, room: String) {
        self.rooms.entry(room).or_default().insert(conn_id);
    }

    fn leave(&mut self, conn_id: ConnId, room: &str) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    /// Sorted so delivery order is stable.
    fn room_members(&self, room: &str) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn deliver(&self, conn_id: ConnId, event: ServerEvent) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        match conn.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                warn!(conn_id, user_id = %conn.user_id, event = ev.name(), "client queue full, frame dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id, "client queue closed");
            }
        }
    }

    fn broadcast(&self, event: ServerEvent) {
        for id in self.connections.keys() {
            self.deliver(*id, event.clone());
        }
    }

    fn broadcast_except_user(&self, user_id: &str, event: ServerEvent) {
        for (id, conn) in &self.connections {
            if conn.user_id != user_id {
                self.deliver(*id, event.clone());
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.presence.snapshot();
        self.metrics.agents_online.set(snapshot.agents.len() as i64);
        self.metrics
            .agents_available
            .set(snapshot.available_count() as i64);
        self.metrics
            .pending_calls
            .set(snapshot.pending_calls.len() as i64);
        self.metrics
            .socket_connections
            .set(self.connections.len() as i64);
        self.snapshot_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallStatus;

    async fn next_named(conn: &mut HubConnection, name: &str) -> ServerEvent {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(2), conn.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("connection queue closed");
            if ev.name() == name {
                return ev;
            }
        }
    }

    fn incoming(call_id: Uuid) -> CallNotification {
        CallNotification::Incoming {
            call_id,
            provider_call_id: Some("CA1".into()),
            from_number: "+15550001111".into(),
            to_number: "+15559990000".into(),
            contact_id: None,
            contact_name: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn connect_sends_connected_with_user_id() {
        let (hub, _actions) = spawn(HubConfig::default(), Arc::new(Metrics::new()));
        let mut a = hub.connect("a", None).await.unwrap();
        assert_eq!(
            next_named(&mut a, "connected").await,
            ServerEvent::Connected { id: "a".into() }
        );
    }

    #[tokio::test]
    async fn status_reaches_room_member_once() {
        let (hub, _actions) = spawn(HubConfig::default(), Arc::new(Metrics::new()));
        let mut a = hub.connect("a", None).await.unwrap();
        next_named(&mut a, "connected").await;
        let call_id = Uuid::new_v4();
        hub.client_event(a.id, ClientEvent::JoinRoom { call_id }).await;
        hub.notify(CallNotification::StatusChanged {
            call_id,
            provider_call_id: None,
            status: CallStatus::Ringing,
            duration_secs: None,
        });
        hub.notify(CallNotification::Started {
            call_id,
            user_id: "a".into(),
            direction: crate::call::CallDirection::Outbound,
            to_number: "+1".into(),
        });
        next_named(&mut a, "call:status").await;
        // The next frame after the single status frame is the started frame.
        let ev = tokio::time::timeout(Duration::from_secs(2), a.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.name(), "call:started");
    }

    #[tokio::test]
    async fn note_fans_out_to_other_tabs_only() {
        let (hub, mut actions) = spawn(HubConfig::default(), Arc::new(Metrics::new()));
        let mut tab1 = hub.connect("a", None).await.unwrap();
        let mut tab2 = hub.connect("a", None).await.unwrap();
        let mut other = hub.connect("b", None).await.unwrap();
        next_named(&mut tab1, "connected").await;
        next_named(&mut tab2, "connected").await;
        next_named(&mut other, "connected").await;

        let call_id = Uuid::new_v4();
        hub.client_event(
            tab1.id,
            ClientEvent::Note {
                call_id,
                note: "callback tomorrow".into(),
            },
        )
        .await;
        match next_named(&mut tab2, "call:note-added").await {
            ServerEvent::NoteAdded { note, user_id, .. } => {
                assert_eq!(note, "callback tomorrow");
                assert_eq!(user_id, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
        let action = tokio::time::timeout(Duration::from_secs(2), actions.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(action, AgentAction::Note { .. }));

        hub.client_event(tab1.id, ClientEvent::ListAgents {}).await;
        next_named(&mut tab1, "agents:list").await;
        assert!(tab1.rx.try_recv().is_err());
        assert!(other.rx.try_recv().map(|e| e.name() != "call:note-added").unwrap_or(true));
    }

    #[tokio::test]
    async fn incoming_adds_pending_and_ended_clears_it() {
        let (hub, _actions) = spawn(HubConfig::default(), Arc::new(Metrics::new()));
        let mut presence = hub.presence();
        let mut a = hub.connect("a", None).await.unwrap();
        next_named(&mut a, "connected").await;
        let call_id = Uuid::new_v4();
        hub.notify(incoming(call_id));
        next_named(&mut a, "call:incoming").await;
        tokio::time::timeout(
            Duration::from_secs(2),
            presence.wait_for(|s| s.pending_calls.contains(&call_id)),
        )
        .await
        .unwrap()
        .unwrap();

        hub.notify(CallNotification::Ended {
            call_id,
            status: CallStatus::NoAnswer,
            duration_secs: Some(0),
        });
        next_named(&mut a, "call:ended").await;
        tokio::time::timeout(
            Duration::from_secs(2),
            presence.wait_for(|s| s.pending_calls.is_empty()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn last_tab_disconnect_broadcasts_offline() {
        let (hub, _actions) = spawn(HubConfig::default(), Arc::new(Metrics::new()));
        let mut watcher = hub.connect("w", None).await.unwrap();
        let tab1 = hub.connect("a", None).await.unwrap();
        let tab2 = hub.connect("a", None).await.unwrap();
        next_named(&mut watcher, "connected").await;
        match next_named(&mut watcher, "agent:status").await {
            ServerEvent::AgentStatus { user_id, status, .. } => {
                assert_eq!(user_id, "a");
                assert_eq!(status, AgentStatus::Online);
            }
            other => panic!("unexpected {:?}", other),
        }

        hub.disconnect(tab1.id).await;
        hub.disconnect(tab2.id).await;
        match next_named(&mut watcher, "agent:status").await {
            ServerEvent::AgentStatus { user_id, status, .. } => {
                assert_eq!(user_id, "a");
                assert_eq!(status, AgentStatus::Offline);
            }
            other => panic!("unexpected {:?}", other),
        }
        let mut presence = hub.presence();
        tokio::time::timeout(
            Duration::from_secs(2),
            presence.wait_for(|s| s.agents.iter().all(|a| a.user_id != "a")),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
