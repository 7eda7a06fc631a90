//! Provider callbacks: call status, recordings, transcriptions and conference
//! participants.
//!
//! Every request is signature-checked against the configured public URL
//! before its body is looked at. A failed check answers 403 and touches
//! nothing. Handlers are safe to replay: the orchestrator treats repeats as
//! no-ops, so a 500 here simply invites the provider to retry.

use super::routes_voice::query_param;
use super::{error_response, AppState};
use crate::call::{CallDirection, CallStatus};
use crate::orchestrator::{
    CallError, ParticipantEvent, ParticipantEventKind, RecordingCallback, StatusUpdate,
};
use crate::telephony::map_twilio_status;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) const SIGNATURE_HEADER: &str = "x-twilio-signature";

/// Decoded form body of a signature-verified callback.
pub(crate) struct WebhookParams(Vec<(String, String)>);

impl WebhookParams {
    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key)?.trim().parse().ok()
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "true" | "True" => Some(true),
            "false" | "False" => Some(false),
            _ => None,
        }
    }

    /// Provider timestamps are RFC 2822.
    fn get_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc2822(self.get(key)?)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Check `X-Twilio-Signature` and decode the form. `kind` labels the metric.
pub(crate) fn verify_webhook(
    state: &AppState,
    kind: &'static str,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<WebhookParams, Response> {
    let params: Vec<(String, String)> = url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let url = state.gateway().config().public_url(path_and_query);

    if !state
        .gateway()
        .validate_webhook_signature(signature, &url, &params)
    {
        warn!(kind, path = uri.path(), "webhook signature rejected");
        state.prom_metrics.record_webhook(kind, "rejected");
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({"error": "invalid signature"})),
        )
            .into_response());
    }
    Ok(WebhookParams(params))
}

/// `callId` query parameter that outbound calls put on their callback URLs.
/// The URL is covered by the signature, so the id is as trusted as the body.
fn callback_call_id(uri: &Uri) -> Option<Uuid> {
    query_param(uri, "callId")?.parse().ok()
}

fn missing(state: &AppState, kind: &'static str, field: &str) -> Response {
    state.prom_metrics.record_webhook(kind, "invalid");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("missing {}", field)})),
    )
        .into_response()
}

fn failed(state: &AppState, kind: &'static str, e: CallError) -> Response {
    let outcome = match e {
        CallError::NotFound(_) => "unknown",
        CallError::Invalid(_) => "invalid",
        _ => "error",
    };
    state.prom_metrics.record_webhook(kind, outcome);
    error_response(e)
}

pub(super) async fn handler_status_callback(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "status";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(call_sid) = params.get("CallSid") else {
        return missing(&state, KIND, "CallSid");
    };
    let raw_status = params.get("CallStatus").unwrap_or_default();
    let status: CallStatus = map_twilio_status(raw_status);
    debug!(call_sid, raw_status, %status, "status callback");

    let update = StatusUpdate {
        provider_call_id: call_sid.to_string(),
        call_id: callback_call_id(&uri),
        status,
        at: params.get_timestamp("Timestamp"),
        duration_secs: params.get_i32("CallDuration"),
        direction: params.get("Direction").map(CallDirection::from_provider),
        from_number: params.get("From").map(str::to_string),
        to_number: params.get("To").map(str::to_string),
        provider_account_id: params.get("AccountSid").map(str::to_string),
    };
    match state.orchestrator.update_call_status(update).await {
        Ok(outcome) => {
            let label = match (outcome.created, outcome.ignored) {
                (_, Some(_)) => "ignored",
                (true, None) => "created",
                (false, None) => "applied",
            };
            state.prom_metrics.record_webhook(KIND, label);
            Json(json!({
                "ok": true,
                "callId": outcome.call.id,
                "status": outcome.call.status,
                "ignored": outcome.ignored.map(|r| r.as_str()),
            }))
            .into_response()
        }
        Err(e) => failed(&state, KIND, e),
    }
}

pub(super) async fn handler_recording_callback(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "recording";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(call_sid) = params.get("CallSid") else {
        return missing(&state, KIND, "CallSid");
    };
    let Some(recording_sid) = params.get("RecordingSid") else {
        return missing(&state, KIND, "RecordingSid");
    };
    let cb = RecordingCallback {
        provider_call_id: call_sid.to_string(),
        call_id: callback_call_id(&uri),
        recording_sid: recording_sid.to_string(),
        url: params.get("RecordingUrl").unwrap_or_default().to_string(),
        duration_secs: params.get_i32("RecordingDuration"),
        channels: params.get_i32("RecordingChannels"),
        status: params.get("RecordingStatus").map(str::to_string),
    };
    match state.orchestrator.handle_recording_ready(cb).await {
        Ok(recording) => {
            state.prom_metrics.record_webhook(KIND, "applied");
            Json(json!({
                "ok": true,
                "recordingId": recording.provider_recording_id,
                "status": recording.status,
            }))
            .into_response()
        }
        Err(e) => failed(&state, KIND, e),
    }
}

pub(super) async fn handler_transcription_callback(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "transcription";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(recording_sid) = params.get("RecordingSid") else {
        return missing(&state, KIND, "RecordingSid");
    };
    let status = params.get("TranscriptionStatus").unwrap_or("completed");
    match state
        .orchestrator
        .handle_transcription(recording_sid, status, params.get("TranscriptionText"))
        .await
    {
        Ok(recording) => {
            state.prom_metrics.record_webhook(KIND, "applied");
            Json(json!({
                "ok": true,
                "transcriptionStatus": recording.transcription_status,
            }))
            .into_response()
        }
        Err(e) => failed(&state, KIND, e),
    }
}

pub(super) async fn handler_conference_callback(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "conference";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(call_sid) = params.get("CallSid") else {
        return missing(&state, KIND, "CallSid");
    };
    let Some(conference_sid) = params.get("ConferenceSid") else {
        return missing(&state, KIND, "ConferenceSid");
    };
    let raw_event = params.get("StatusCallbackEvent").unwrap_or_default();
    let Some(kind) = ParticipantEventKind::from_provider(raw_event) else {
        // conference-start, conference-end and friends carry nothing to store.
        state.prom_metrics.record_webhook(KIND, "ignored");
        return Json(json!({"ok": true, "ignored": raw_event})).into_response();
    };
    let ev = ParticipantEvent {
        friendly_name: params.get("FriendlyName").unwrap_or(call_sid).to_string(),
        conference_sid: conference_sid.to_string(),
        provider_call_id: call_sid.to_string(),
        kind,
        phone_number: params.get("From").map(str::to_string),
        muted: params.get_bool("Muted"),
        on_hold: params.get_bool("Hold"),
        at: params.get_timestamp("Timestamp"),
    };
    match state.orchestrator.handle_participant_event(ev).await {
        Ok(participant) => {
            state.prom_metrics.record_webhook(KIND, "applied");
            Json(json!({
                "ok": true,
                "participantId": participant.map(|p| p.id),
            }))
            .into_response()
        }
        Err(e) => failed(&state, KIND, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> WebhookParams {
        WebhookParams(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn callback_call_id_reads_the_signed_query() {
        let id = Uuid::new_v4();
        let uri: Uri = format!("/api/webhooks/telephony/status?callId={}", id)
            .parse()
            .unwrap();
        assert_eq!(callback_call_id(&uri), Some(id));
        let bad: Uri = "/api/webhooks/telephony/status?callId=nope".parse().unwrap();
        assert_eq!(callback_call_id(&bad), None);
        let none: Uri = "/api/webhooks/telephony/status".parse().unwrap();
        assert_eq!(callback_call_id(&none), None);
    }

    #[test]
    fn empty_values_count_as_missing() {
        let p = params(&[("CallSid", ""), ("CallStatus", "ringing")]);
        assert!(p.get("CallSid").is_none());
        assert_eq!(p.get("CallStatus"), Some("ringing"));
    }

    #[test]
    fn parses_numbers_booleans_and_rfc2822() {
        let p = params(&[
            ("CallDuration", "42"),
            ("Muted", "true"),
            ("Hold", "False"),
            ("Timestamp", "Tue, 10 Oct 2023 14:03:05 +0000"),
        ]);
        assert_eq!(p.get_i32("CallDuration"), Some(42));
        assert_eq!(p.get_bool("Muted"), Some(true));
        assert_eq!(p.get_bool("Hold"), Some(false));
        let ts = p.get_timestamp("Timestamp").unwrap();
        assert_eq!(ts.to_rfc3339(), "2023-10-10T14:03:05+00:00");
    }

    #[test]
    fn malformed_values_are_none() {
        let p = params(&[("CallDuration", "abc"), ("Timestamp", "yesterday")]);
        assert!(p.get_i32("CallDuration").is_none());
        assert!(p.get_timestamp("Timestamp").is_none());
    }
}
