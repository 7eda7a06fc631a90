//! # Orchestrator: Call Lifecycle Coordination
//!
//! Owns the call state machine and sequences registry writes, provider calls,
//! contact resolution and notifications. Every entry point (webhook, HTTP
//! action, socket action) ends up here.
//!
//! ## Status updates
//!
//! A status change is read → [`transition::decide`] → compare-and-swap write
//! on the row's `version`. A lost race re-reads and decides again, so a
//! concurrent webhook and hang-up can never interleave. Ignored observations
//! (replays, stale or backward reports) are logged at debug and counted.
//!
//! ## Ownership
//!
//! Calls belong to `user_id`. The assigned agent may also act on a call.
//! Anyone else gets `NotFound`, never a hint that the call exists.

mod contacts;
pub mod transition;

pub use contacts::{normalize_e164, ContactLookup};
pub use transition::{Decision, IgnoreReason, StatusObservation};

use crate::call::{
    CallDirection, CallStatus, ParticipantRole, RecordingStatus, TranscriptionStatus,
};
use crate::db::{
    CallDetails, CallEventRecord, CallFilter, CallRecord, CallRegistry, CallStats, ContactMatch,
    NewCall, NewParticipant, NewRecording, Page, ParticipantRecord, RecordingRecord, StatsRange,
};
use crate::events::{CallNotification, CallNotifier, NullNotifier};
use crate::presence::PresenceSnapshot;
use crate::prom_metrics::Metrics;
use crate::telephony::{
    client_identity, user_id_from_identity, AccessToken, TelephonyError, TelephonyGateway,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("call {id} is {status}, cannot {action}")]
    InvalidState {
        id: Uuid,
        status: CallStatus,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Provider(#[from] TelephonyError),

    #[error("registry error: {0}")]
    Registry(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Owner of inbound calls when no agent is online, and the dial target then.
    pub fallback_owner_id: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            fallback_owner_id: "admin".to_string(),
        }
    }
}

/// Outbound call request from an agent.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct InitiateCall {
    pub to_number: String,
    pub contact_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub lead_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedOutbound {
    pub call: CallRecord,
    pub token: AccessToken,
}

/// The provider's voice webhook for a new inbound call.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub provider_call_id: String,
    pub provider_account_id: Option<String>,
    pub from_number: String,
    pub to_number: String,
    pub status: Option<CallStatus>,
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct IncomingRouting {
    pub call: CallRecord,
    pub agent_id: String,
    pub twiml: String,
}

/// A status callback after mapping, before it touches the registry.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub provider_call_id: String,
    /// Internal id carried on the callback URL of calls we placed.
    pub call_id: Option<Uuid>,
    pub status: CallStatus,
    pub at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i32>,
    pub direction: Option<CallDirection>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub provider_account_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub call: CallRecord,
    pub created: bool,
    /// `None` when the update was applied.
    pub ignored: Option<IgnoreReason>,
}

#[derive(Debug, Clone)]
pub struct RecordingCallback {
    pub provider_call_id: String,
    pub call_id: Option<Uuid>,
    pub recording_sid: String,
    pub url: String,
    pub duration_secs: Option<i32>,
    pub channels: Option<i32>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantEventKind {
    Join,
    Leave,
    Mute,
    Unmute,
    Hold,
    Unhold,
}

impl ParticipantEventKind {
    /// Twilio `StatusCallbackEvent` values for conference participants.
    pub fn from_provider(event: &str) -> Option<Self> {
        match event {
            "participant-join" => Some(ParticipantEventKind::Join),
            "participant-leave" => Some(ParticipantEventKind::Leave),
            "participant-mute" => Some(ParticipantEventKind::Mute),
            "participant-unmute" => Some(ParticipantEventKind::Unmute),
            "participant-hold" => Some(ParticipantEventKind::Hold),
            "participant-unhold" => Some(ParticipantEventKind::Unhold),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ParticipantEventKind::Join => "participant-join",
            ParticipantEventKind::Leave => "participant-leave",
            ParticipantEventKind::Mute => "participant-mute",
            ParticipantEventKind::Unmute => "participant-unmute",
            ParticipantEventKind::Hold => "participant-hold",
            ParticipantEventKind::Unhold => "participant-unhold",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantEvent {
    /// Conference name; by convention the internal call id or the parent provider call id.
    pub friendly_name: String,
    pub conference_sid: String,
    /// The participant's own leg.
    pub provider_call_id: String,
    pub kind: ParticipantEventKind,
    pub phone_number: Option<String>,
    pub muted: Option<bool>,
    pub on_hold: Option<bool>,
    pub at: Option<DateTime<Utc>>,
}

/// Client actions forwarded by the presence hub.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentAction {
    Accepted { call_id: Uuid, agent_id: String },
    Rejected { call_id: Uuid, agent_id: String },
    Note {
        call_id: Uuid,
        agent_id: String,
        note: String,
    },
}

/// A call joined with what the UI shows next to it.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedCall {
    #[serde(flatten)]
    pub call: CallRecord,
    pub latest_recording: Option<RecordingRecord>,
    pub participants: Vec<ParticipantRecord>,
    pub contact: Option<ContactMatch>,
}

#[derive(Debug, Serialize)]
pub struct EnrichedPage {
    pub calls: Vec<EnrichedCall>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

pub struct CallOrchestrator {
    registry: Arc<dyn CallRegistry>,
    gateway: Arc<dyn TelephonyGateway>,
    contacts: Arc<dyn ContactLookup>,
    notifier: Arc<dyn CallNotifier>,
    presence: watch::Receiver<PresenceSnapshot>,
    metrics: Arc<Metrics>,
    config: OrchestratorConfig,
}

impl CallOrchestrator {
    pub fn new(
        registry: Arc<dyn CallRegistry>,
        gateway: Arc<dyn TelephonyGateway>,
        contacts: Arc<dyn ContactLookup>,
        config: OrchestratorConfig,
    ) -> Self {
        let (_tx, presence) = watch::channel(PresenceSnapshot::default());
        CallOrchestrator {
            registry,
            gateway,
            contacts,
            notifier: Arc::new(NullNotifier),
            presence,
            metrics: Arc::new(Metrics::new()),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CallNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_presence(mut self, presence: watch::Receiver<PresenceSnapshot>) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<dyn CallRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<dyn TelephonyGateway> {
        &self.gateway
    }

    // ── Tokens and outbound calls ───────────────────────────────

    pub fn generate_token(
        &self,
        user_id: &str,
        user_email: Option<&str>,
    ) -> Result<AccessToken, CallError> {
        Ok(self.gateway.generate_access_token(user_id, user_email, None)?)
    }

    /// Create the call row, ask the provider to place it, and hand back the
    /// row plus a browser token. A provider failure leaves the row `failed`.
    pub async fn initiate_call(
        &self,
        user_id: &str,
        user_email: Option<&str>,
        req: InitiateCall,
    ) -> Result<InitiatedOutbound, CallError> {
        let to_number = normalize_e164(&req.to_number)
            .ok_or_else(|| CallError::Invalid(format!("invalid phone number '{}'", req.to_number)))?;
        if !self.gateway.is_configured() {
            return Err(TelephonyError::NotConfigured.into());
        }
        let token = self.gateway.generate_access_token(user_id, user_email, None)?;

        let contact = match req.contact_id {
            Some(_) => None,
            None => self.lookup_contact(&to_number).await,
        };
        let now = Utc::now();
        let call = self
            .registry
            .create_call(NewCall {
                provider_call_id: None,
                provider_account_id: Some(self.gateway.config().account_sid.clone()),
                direction: CallDirection::Outbound,
                status: CallStatus::Initiated,
                from_number: self.gateway.config().caller_id.clone(),
                to_number: to_number.clone(),
                user_id: user_id.to_string(),
                contact_id: req.contact_id.or(contact.as_ref().map(|c| c.contact_id)),
                deal_id: req.deal_id.or(contact.as_ref().and_then(|c| c.deal_id)),
                lead_id: req.lead_id.or(contact.as_ref().and_then(|c| c.lead_id)),
                queue_name: None,
                started_at: now,
                status_changed_at: now,
            })
            .await?;
        self.record_event(call.id, "initiated", json!({ "to": to_number }), Some(user_id))
            .await;
        info!(call_id = %call.id, user_id, "initiating outbound call");

        let placed = match self.gateway.initiate_call(&to_number, call.id, user_id).await {
            Ok(placed) => placed,
            Err(e) => {
                warn!(call_id = %call.id, error = %e, "provider refused outbound call");
                self.record_event(
                    call.id,
                    "provider-error",
                    json!({ "error": e.to_string() }),
                    Some(user_id),
                )
                .await;
                let failed = StatusObservation {
                    status: CallStatus::Failed,
                    at: Utc::now(),
                    duration_secs: Some(0),
                };
                if let Err(mark_err) = self.apply(call, |_| failed.clone()).await {
                    warn!(error = %mark_err, "could not mark call failed");
                }
                return Err(e.into());
            }
        };

        // A status callback may already have linked the id.
        if !self
            .registry
            .set_provider_call_id(call.id, &placed.provider_call_id)
            .await?
        {
            warn!(call_id = %call.id, provider_call_id = %placed.provider_call_id, "call already carries another provider id");
        }
        self.notifier.notify(CallNotification::Started {
            call_id: call.id,
            user_id: user_id.to_string(),
            direction: CallDirection::Outbound,
            to_number: to_number.clone(),
        });

        let call = self.require(call.id).await?;
        let provider_status = placed.status.to_call_status();
        let (call, _) = self
            .apply(call, |_| StatusObservation {
                status: provider_status,
                at: Utc::now(),
                duration_secs: None,
            })
            .await?;
        Ok(InitiatedOutbound { call, token })
    }

    // ── Inbound calls ───────────────────────────────────────────

    /// First contact for an inbound call: record it, resolve the caller and
    /// pick the agent whose browser the TwiML will ring.
    pub async fn handle_incoming_call(&self, incoming: IncomingCall) -> Result<IncomingRouting, CallError> {
        if incoming.provider_call_id.is_empty() {
            return Err(CallError::Invalid("missing provider call id".into()));
        }
        let at = incoming.at.unwrap_or_else(Utc::now);
        let agent_id = self.resolve_agent();
        let from_e164 = normalize_e164(&incoming.from_number);
        let contact = match from_e164.as_deref() {
            Some(number) => self.lookup_contact(number).await,
            None => None,
        };

        let (call, created) = self
            .registry
            .find_or_create_by_provider_call_id(NewCall {
                provider_call_id: Some(incoming.provider_call_id.clone()),
                provider_account_id: incoming.provider_account_id.clone(),
                direction: CallDirection::Inbound,
                status: CallStatus::Initiated,
                from_number: from_e164.unwrap_or_else(|| incoming.from_number.clone()),
                to_number: incoming.to_number.clone(),
                user_id: agent_id.clone(),
                contact_id: contact.as_ref().map(|c| c.contact_id),
                deal_id: contact.as_ref().and_then(|c| c.deal_id),
                lead_id: contact.as_ref().and_then(|c| c.lead_id),
                queue_name: None,
                started_at: at,
                status_changed_at: at,
            })
            .await?;

        if created {
            info!(call_id = %call.id, provider_call_id = %incoming.provider_call_id, agent_id = %agent_id, "incoming call");
            self.record_event(
                call.id,
                "incoming",
                json!({ "from": call.from_number, "routedTo": agent_id }),
                None,
            )
            .await;
            self.notifier.notify(CallNotification::Incoming {
                call_id: call.id,
                provider_call_id: call.provider_call_id.clone(),
                from_number: call.from_number.clone(),
                to_number: call.to_number.clone(),
                contact_id: call.contact_id,
                contact_name: contact.and_then(|c| c.display_name),
                created_at: call.created_at,
            });
        }

        let status = incoming.status.unwrap_or(CallStatus::Ringing);
        let (call, _) = self
            .apply(call, |_| StatusObservation {
                status,
                at,
                duration_secs: None,
            })
            .await?;

        // Replays route to whoever owns the row, not to a newly idle agent.
        let target = if created { agent_id } else { call.user_id.clone() };
        let twiml = self.gateway.generate_incoming_twiml(&client_identity(&target));
        Ok(IncomingRouting {
            call,
            agent_id: target,
            twiml,
        })
    }

    /// Outbound voice URL: TwiML that bridges the agent leg to the customer.
    pub fn outbound_twiml(&self, to_number: &str) -> Result<String, CallError> {
        let to = normalize_e164(to_number)
            .ok_or_else(|| CallError::Invalid(format!("invalid phone number '{}'", to_number)))?;
        Ok(self.gateway.generate_outbound_twiml(&to))
    }

    fn resolve_agent(&self) -> String {
        let snapshot = self.presence.borrow();
        match snapshot.longest_idle_available() {
            Some(agent) => agent.user_id.clone(),
            None => {
                warn!(fallback = %self.config.fallback_owner_id, "no agent available, routing to fallback owner");
                self.config.fallback_owner_id.clone()
            }
        }
    }

    /// Dial fallback. An unanswered dial becomes voicemail; an answered one
    /// has simply finished and the caller is hung up on.
    pub async fn handle_voicemail(
        &self,
        provider_call_id: &str,
        dial_status: Option<&str>,
        at: Option<DateTime<Utc>>,
    ) -> Result<String, CallError> {
        if matches!(dial_status, Some("completed") | Some("answered")) {
            return Ok(crate::telephony::twiml::hangup());
        }
        let Some(call) = self.registry.find_by_provider_call_id(provider_call_id).await? else {
            warn!(provider_call_id, "voicemail for unknown call");
            return Ok(self.gateway.generate_voicemail_twiml());
        };
        let at = at.unwrap_or_else(Utc::now);
        let (call, ignored) = self
            .apply(call, |_| StatusObservation {
                status: CallStatus::Voicemail,
                at,
                duration_secs: None,
            })
            .await?;
        if ignored.is_none() {
            self.record_event(call.id, "voicemail", json!({ "dialStatus": dial_status }), None)
                .await;
        }
        Ok(self.gateway.generate_voicemail_twiml())
    }

    // ── Webhook-driven updates ──────────────────────────────────

    /// Idempotent status update keyed on the provider call id. Unknown ids
    /// create the call; the first writer's metadata wins.
    pub async fn update_call_status(&self, update: StatusUpdate) -> Result<StatusOutcome, CallError> {
        if update.provider_call_id.is_empty() {
            return Err(CallError::Invalid("missing provider call id".into()));
        }
        let at = update.at.unwrap_or_else(Utc::now);
        let known = match self
            .registry
            .find_by_provider_call_id(&update.provider_call_id)
            .await?
        {
            Some(call) => Some(call),
            None => self.link_placed_call(&update).await?,
        };
        let (call, created) = match known {
            Some(call) => (call, false),
            None => {
                let direction = update.direction.unwrap_or(CallDirection::Inbound);
                // Browser legs identify their agent as `client:user_<id>`.
                let owner = [update.from_number.as_deref(), update.to_number.as_deref()]
                    .into_iter()
                    .flatten()
                    .find_map(user_id_from_identity)
                    .unwrap_or(self.config.fallback_owner_id.as_str())
                    .to_string();
                let (call, created) = self
                    .registry
                    .find_or_create_by_provider_call_id(NewCall {
                        provider_call_id: Some(update.provider_call_id.clone()),
                        provider_account_id: update.provider_account_id.clone(),
                        direction,
                        status: CallStatus::Initiated,
                        from_number: update.from_number.clone().unwrap_or_default(),
                        to_number: update.to_number.clone().unwrap_or_default(),
                        user_id: owner,
                        contact_id: None,
                        deal_id: None,
                        lead_id: None,
                        queue_name: None,
                        started_at: at,
                        status_changed_at: at,
                    })
                    .await?;
                if created {
                    info!(call_id = %call.id, provider_call_id = %update.provider_call_id, "call created from status callback");
                    self.record_event(
                        call.id,
                        "created-from-webhook",
                        json!({ "status": update.status }),
                        None,
                    )
                    .await;
                }
                (call, created)
            }
        };

        let obs = StatusObservation {
            status: update.status,
            at,
            duration_secs: update.duration_secs,
        };
        let (call, ignored) = self.apply(call, |_| obs.clone()).await?;
        Ok(StatusOutcome {
            call,
            created,
            ignored,
        })
    }

    /// The provider may report `initiated` before the create-call response
    /// reaches [`Self::initiate_call`]. Attach the provider id to the row named
    /// on our own callback URL so that webhook does not start a second call.
    async fn link_placed_call(&self, update: &StatusUpdate) -> Result<Option<CallRecord>, CallError> {
        let Some(id) = update.call_id else {
            return Ok(None);
        };
        if !self
            .registry
            .set_provider_call_id(id, &update.provider_call_id)
            .await?
        {
            return Ok(None);
        }
        debug!(call_id = %id, provider_call_id = %update.provider_call_id, "provider id linked from status callback");
        Ok(self.registry.find_by_id(id).await?)
    }

    pub async fn handle_recording_ready(
        &self,
        cb: RecordingCallback,
    ) -> Result<RecordingRecord, CallError> {
        if cb.recording_sid.is_empty() {
            return Err(CallError::Invalid("missing recording id".into()));
        }
        let mut found = self
            .registry
            .find_by_provider_call_id(&cb.provider_call_id)
            .await?;
        if let (None, Some(id)) = (&found, cb.call_id) {
            found = self.registry.find_by_id(id).await?;
        }
        let call = found.ok_or_else(|| CallError::NotFound(cb.provider_call_id.clone()))?;
        let status = RecordingStatus::from_provider(cb.status.as_deref().unwrap_or("completed"));
        let recording = self
            .registry
            .upsert_recording(NewRecording {
                call_id: call.id,
                provider_recording_id: cb.recording_sid.clone(),
                url: cb.url.clone(),
                duration_secs: cb.duration_secs,
                channels: cb.channels.unwrap_or(1),
                status,
            })
            .await?;
        self.record_event(
            call.id,
            "recording",
            json!({ "recordingSid": cb.recording_sid, "status": status }),
            None,
        )
        .await;
        if status == RecordingStatus::Completed {
            self.notifier.notify(CallNotification::RecordingReady {
                call_id: call.id,
                recording_id: recording.provider_recording_id.clone(),
                url: recording.url.clone(),
                duration_secs: recording.duration_secs,
            });
        }
        Ok(recording)
    }

    pub async fn handle_transcription(
        &self,
        recording_sid: &str,
        status: &str,
        text: Option<&str>,
    ) -> Result<RecordingRecord, CallError> {
        let status = TranscriptionStatus::from_provider(status);
        let recording = self
            .registry
            .update_transcription(recording_sid, status, text)
            .await?
            .ok_or_else(|| CallError::NotFound(recording_sid.to_string()))?;
        self.record_event(
            recording.call_id,
            "transcription",
            json!({ "recordingSid": recording_sid, "status": status }),
            None,
        )
        .await;
        Ok(recording)
    }

    /// Conference participant callbacks maintain the participant rows.
    pub async fn handle_participant_event(
        &self,
        ev: ParticipantEvent,
    ) -> Result<Option<ParticipantRecord>, CallError> {
        let call = self.resolve_conference_call(&ev).await?;
        let at = ev.at.unwrap_or_else(Utc::now);
        if call.conference_sid.as_deref() != Some(ev.conference_sid.as_str()) {
            self.registry.set_conference(call.id, &ev.conference_sid).await?;
        }
        let existing = self
            .registry
            .find_participant_by_leg(call.id, &ev.provider_call_id)
            .await?
            .filter(|p| p.left_at.is_none());

        let participant = match ev.kind {
            ParticipantEventKind::Join => match existing {
                Some(p) => Some(p),
                None => {
                    let is_primary = call.provider_call_id.as_deref() == Some(ev.provider_call_id.as_str());
                    let (role, default_number) = match (is_primary, call.direction) {
                        (true, CallDirection::Inbound) => (ParticipantRole::Caller, call.from_number.clone()),
                        (true, CallDirection::Outbound) => (ParticipantRole::Callee, call.to_number.clone()),
                        (false, _) => (ParticipantRole::Conference, String::new()),
                    };
                    Some(
                        self.registry
                            .add_participant(NewParticipant {
                                call_id: call.id,
                                provider_leg_id: Some(ev.provider_call_id.clone()),
                                phone_number: ev.phone_number.clone().unwrap_or(default_number),
                                display_name: None,
                                role,
                                joined_at: at,
                                muted: ev.muted.unwrap_or(false),
                                on_hold: ev.on_hold.unwrap_or(false),
                            })
                            .await?,
                    )
                }
            },
            ParticipantEventKind::Leave => match existing {
                Some(mut p) => {
                    self.registry.mark_participant_left(p.id, at).await?;
                    p.left_at = Some(at);
                    Some(p)
                }
                None => None,
            },
            kind => match existing {
                Some(p) => {
                    let (muted, on_hold) = match kind {
                        ParticipantEventKind::Mute => (Some(true), None),
                        ParticipantEventKind::Unmute => (Some(false), None),
                        ParticipantEventKind::Hold => (None, Some(true)),
                        _ => (None, Some(false)),
                    };
                    self.registry.set_participant_flags(p.id, muted, on_hold).await?
                }
                None => None,
            },
        };

        self.record_event(
            call.id,
            ev.kind.as_str(),
            json!({ "conferenceSid": ev.conference_sid, "leg": ev.provider_call_id }),
            None,
        )
        .await;
        Ok(participant)
    }

    async fn resolve_conference_call(&self, ev: &ParticipantEvent) -> Result<CallRecord, CallError> {
        if let Ok(id) = ev.friendly_name.parse::<Uuid>() {
            if let Some(call) = self.registry.find_by_id(id).await? {
                return Ok(call);
            }
        }
        for sid in [&ev.friendly_name, &ev.provider_call_id] {
            if let Some(call) = self.registry.find_by_provider_call_id(sid).await? {
                return Ok(call);
            }
        }
        Err(CallError::NotFound(ev.friendly_name.clone()))
    }

    // ── Agent actions ───────────────────────────────────────────

    pub async fn update_call_details(
        &self,
        id: Uuid,
        user_id: &str,
        details: CallDetails,
    ) -> Result<CallRecord, CallError> {
        let call = self
            .registry
            .update_details(id, user_id, &details)
            .await?
            .ok_or_else(|| CallError::NotFound(id.to_string()))?;
        self.record_event(
            id,
            "details-updated",
            json!({
                "disposition": details.disposition,
                "notes": details.notes.is_some(),
                "summary": details.summary.is_some(),
            }),
            Some(user_id),
        )
        .await;
        Ok(call)
    }

    /// Hang up. The provider request is best effort; the local state moves
    /// to `completed` (answered) or `canceled` regardless.
    pub async fn end_call(&self, id: Uuid, user_id: &str) -> Result<CallRecord, CallError> {
        let call = self.owned(id, user_id).await?;
        if call.status.is_terminal() {
            return Err(CallError::InvalidState {
                id,
                status: call.status,
                action: "end",
            });
        }
        if let Some(ref sid) = call.provider_call_id {
            if let Err(e) = self.gateway.end_call(sid).await {
                warn!(call_id = %id, provider_call_id = %sid, error = %e, "provider hang-up failed");
            }
        }
        let at = Utc::now();
        let (call, _) = self
            .apply(call, |current| StatusObservation {
                status: transition::local_end_status(current.status),
                at,
                duration_secs: None,
            })
            .await?;
        self.record_event(id, "ended-by-user", json!({ "status": call.status }), Some(user_id))
            .await;
        Ok(call)
    }

    pub async fn delete_call(&self, id: Uuid, user_id: &str) -> Result<(), CallError> {
        if !self.registry.soft_delete(id, user_id).await? {
            return Err(CallError::NotFound(id.to_string()));
        }
        self.record_event(id, "deleted", json!({}), Some(user_id)).await;
        Ok(())
    }

    pub async fn restore_call(&self, id: Uuid, user_id: &str) -> Result<CallRecord, CallError> {
        if !self.registry.restore(id, user_id).await? {
            return Err(CallError::NotFound(id.to_string()));
        }
        self.record_event(id, "restored", json!({}), Some(user_id)).await;
        self.require(id).await
    }

    pub async fn get_call_stats(
        &self,
        user_id: Option<&str>,
        range: StatsRange,
    ) -> Result<CallStats, CallError> {
        Ok(self.registry.get_stats(user_id, range).await?)
    }

    pub async fn get_call(&self, id: Uuid, user_id: &str) -> Result<EnrichedCall, CallError> {
        let call = self.owned(id, user_id).await?;
        self.enrich(call).await
    }

    pub async fn list_calls(
        &self,
        user_id: &str,
        filter: &CallFilter,
        page: Page,
    ) -> Result<EnrichedPage, CallError> {
        let result = self.registry.find_by_user(user_id, filter, page).await?;
        let mut calls = Vec::with_capacity(result.calls.len());
        for call in result.calls {
            calls.push(self.enrich(call).await?);
        }
        Ok(EnrichedPage {
            calls,
            total: result.total,
            page: result.page,
            per_page: result.per_page,
        })
    }

    pub async fn list_call_events(
        &self,
        id: Uuid,
        user_id: &str,
    ) -> Result<Vec<CallEventRecord>, CallError> {
        self.owned(id, user_id).await?;
        Ok(self.registry.list_events(id).await?)
    }

    pub async fn send_dtmf(&self, id: Uuid, user_id: &str, digits: &str) -> Result<(), CallError> {
        if !crate::telephony::is_valid_dtmf(digits) {
            return Err(CallError::Invalid(format!("invalid DTMF digits '{}'", digits)));
        }
        let call = self.live_call(id, user_id, "send digits").await?;
        let sid = call
            .provider_call_id
            .as_deref()
            .ok_or_else(|| CallError::InvalidState {
                id,
                status: call.status,
                action: "send digits",
            })?;
        self.gateway.send_dtmf(sid, digits).await?;
        self.record_event(id, "dtmf", json!({ "digits": digits.len() }), Some(user_id))
            .await;
        Ok(())
    }

    pub async fn set_participant_mute(
        &self,
        id: Uuid,
        user_id: &str,
        participant_id: i64,
        muted: bool,
    ) -> Result<ParticipantRecord, CallError> {
        let (conference_sid, leg) = self.conference_leg(id, user_id, participant_id).await?;
        self.gateway
            .set_participant_mute(&conference_sid, &leg, muted)
            .await?;
        let participant = self
            .registry
            .set_participant_flags(participant_id, Some(muted), None)
            .await?
            .ok_or_else(|| CallError::NotFound(participant_id.to_string()))?;
        self.record_event(id, "mute", json!({ "participantId": participant_id, "muted": muted }), Some(user_id))
            .await;
        Ok(participant)
    }

    pub async fn set_participant_hold(
        &self,
        id: Uuid,
        user_id: &str,
        participant_id: i64,
        on_hold: bool,
    ) -> Result<ParticipantRecord, CallError> {
        let (conference_sid, leg) = self.conference_leg(id, user_id, participant_id).await?;
        self.gateway
            .set_participant_hold(&conference_sid, &leg, on_hold)
            .await?;
        let participant = self
            .registry
            .set_participant_flags(participant_id, None, Some(on_hold))
            .await?
            .ok_or_else(|| CallError::NotFound(participant_id.to_string()))?;
        self.record_event(id, "hold", json!({ "participantId": participant_id, "onHold": on_hold }), Some(user_id))
            .await;
        Ok(participant)
    }

    async fn conference_leg(
        &self,
        id: Uuid,
        user_id: &str,
        participant_id: i64,
    ) -> Result<(String, String), CallError> {
        let call = self.live_call(id, user_id, "control participants").await?;
        let conference_sid = call.conference_sid.clone().ok_or(CallError::InvalidState {
            id,
            status: call.status,
            action: "control participants without a conference",
        })?;
        let participant = self
            .registry
            .list_participants(id)
            .await?
            .into_iter()
            .find(|p| p.id == participant_id && p.left_at.is_none())
            .ok_or_else(|| CallError::NotFound(participant_id.to_string()))?;
        let leg = participant
            .provider_leg_id
            .ok_or_else(|| CallError::Invalid("participant has no provider leg".into()))?;
        Ok((conference_sid, leg))
    }

    /// Socket actions arrive after the hub already updated presence. Missing
    /// calls are logged no-ops.
    pub async fn handle_agent_action(&self, action: AgentAction) {
        let result = match &action {
            AgentAction::Accepted { call_id, agent_id } => {
                match self.registry.assign_agent(*call_id, agent_id).await {
                    Ok(true) => {
                        self.record_event(*call_id, "agent-accepted", json!({}), Some(agent_id))
                            .await;
                        Ok(())
                    }
                    Ok(false) => {
                        debug!(call_id = %call_id, "accept for unknown call");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            AgentAction::Rejected { call_id, agent_id } => {
                self.event_if_exists(*call_id, "agent-rejected", json!({}), agent_id)
                    .await
            }
            AgentAction::Note {
                call_id,
                agent_id,
                note,
            } => {
                self.event_if_exists(*call_id, "note", json!({ "note": note }), agent_id)
                    .await
            }
        };
        if let Err(e) = result {
            warn!(?action, error = %e, "agent action failed");
        }
    }

    async fn event_if_exists(
        &self,
        call_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
        agent_id: &str,
    ) -> anyhow::Result<()> {
        if self.registry.find_by_id(call_id).await?.is_none() {
            debug!(call_id = %call_id, event_type, "agent action for unknown call");
            return Ok(());
        }
        self.registry
            .append_event(call_id, event_type, payload, Some(agent_id))
            .await?;
        Ok(())
    }

    /// Drain hub actions until the hub goes away.
    pub async fn run_agent_actions(self: Arc<Self>, mut actions: mpsc::Receiver<AgentAction>) {
        while let Some(action) = actions.recv().await {
            self.handle_agent_action(action).await;
        }
        debug!("agent action channel closed");
    }

    // ── Internals ───────────────────────────────────────────────

    async fn require(&self, id: Uuid) -> Result<CallRecord, CallError> {
        self.registry
            .find_by_id(id)
            .await?
            .ok_or_else(|| CallError::NotFound(id.to_string()))
    }

    /// The call if `user_id` owns it or is the assigned agent.
    async fn owned(&self, id: Uuid, user_id: &str) -> Result<CallRecord, CallError> {
        let call = self.require(id).await?;
        if call.user_id == user_id || call.assigned_agent_id.as_deref() == Some(user_id) {
            Ok(call)
        } else {
            Err(CallError::NotFound(id.to_string()))
        }
    }

    async fn live_call(
        &self,
        id: Uuid,
        user_id: &str,
        action: &'static str,
    ) -> Result<CallRecord, CallError> {
        let call = self.owned(id, user_id).await?;
        if call.status.is_terminal() {
            return Err(CallError::InvalidState {
                id,
                status: call.status,
                action,
            });
        }
        Ok(call)
    }

    async fn enrich(&self, call: CallRecord) -> Result<EnrichedCall, CallError> {
        let latest_recording = self.registry.latest_recording(call.id).await?;
        let participants = self.registry.list_participants(call.id).await?;
        let counterparty = match call.direction {
            CallDirection::Inbound => &call.from_number,
            CallDirection::Outbound => &call.to_number,
        };
        let contact = match normalize_e164(counterparty) {
            Some(number) => self.lookup_contact(&number).await,
            None => None,
        };
        Ok(EnrichedCall {
            call,
            latest_recording,
            participants,
            contact,
        })
    }

    async fn lookup_contact(&self, e164: &str) -> Option<ContactMatch> {
        match self.contacts.find_by_phone(e164).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "contact lookup failed");
                None
            }
        }
    }

    async fn record_event(
        &self,
        call_id: Uuid,
        event_type: &str,
        payload: serde_json::Value,
        user_id: Option<&str>,
    ) {
        if let Err(e) = self
            .registry
            .append_event(call_id, event_type, payload, user_id)
            .await
        {
            warn!(call_id = %call_id, event_type, error = %e, "failed to append call event");
        }
    }

    /// Decide and write one status observation under the row's version,
    /// re-reading on conflict. `observe` is re-run against each fresh read.
    async fn apply<F>(
        &self,
        mut call: CallRecord,
        observe: F,
    ) -> Result<(CallRecord, Option<IgnoreReason>), CallError>
    where
        F: Fn(&CallRecord) -> StatusObservation,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let obs = observe(&call);
            let patch = match transition::decide(&call, &obs) {
                Decision::Apply(patch) => patch,
                Decision::Ignore(reason) => {
                    debug!(
                        call_id = %call.id,
                        current = %call.status,
                        reported = %obs.status,
                        reason = reason.as_str(),
                        "status report ignored"
                    );
                    self.metrics.record_ignored(reason.as_str());
                    return Ok((call, Some(reason)));
                }
            };
            match self.registry.update_status(call.id, call.version, &patch).await? {
                Some(updated) => {
                    self.after_transition(&call, &updated).await;
                    return Ok((updated, None));
                }
                None => {
                    debug!(call_id = %call.id, "version conflict, retrying");
                    call = self.require(call.id).await?;
                }
            }
        }
        Err(CallError::Registry(anyhow::anyhow!(
            "call {} status update lost {} races",
            call.id,
            MAX_CAS_ATTEMPTS
        )))
    }

    async fn after_transition(&self, before: &CallRecord, after: &CallRecord) {
        if before.status == after.status {
            debug!(call_id = %after.id, status = %after.status, "call timing merged");
            self.record_event(
                after.id,
                "timing-updated",
                json!({ "endedAt": after.ended_at, "durationSecs": after.duration_secs }),
                None,
            )
            .await;
            return;
        }
        info!(
            call_id = %after.id,
            from = %before.status,
            to = %after.status,
            "call status changed"
        );
        self.metrics.record_transition(after.status.as_str());
        self.record_event(
            after.id,
            "status-changed",
            json!({
                "from": before.status,
                "to": after.status,
                "at": after.status_changed_at,
                "durationSecs": after.duration_secs,
            }),
            None,
        )
        .await;
        self.notifier.notify(CallNotification::StatusChanged {
            call_id: after.id,
            provider_call_id: after.provider_call_id.clone(),
            status: after.status,
            duration_secs: after.duration_secs,
        });
        if after.status.is_terminal() && !before.status.is_terminal() {
            self.notifier.notify(CallNotification::Ended {
                call_id: after.id,
                status: after.status,
                duration_secs: after.duration_secs,
            });
        }
    }
}
