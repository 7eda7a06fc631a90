//! TwiML fetch endpoints. The provider requests these when a call starts and
//! when an inbound dial finishes, and executes whatever document comes back.

use super::routes_webhooks::verify_webhook;
use super::AppState;
use crate::orchestrator::{CallError, IncomingCall};
use crate::telephony::{map_twilio_status, RejectReason};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{error, warn};

fn twiml(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

pub(super) fn query_param(uri: &Uri, key: &str) -> Option<String> {
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

pub(super) async fn handler_voice_incoming(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "voice-incoming";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(call_sid) = params.get("CallSid") else {
        state.prom_metrics.record_webhook(KIND, "invalid");
        return twiml(state.gateway().generate_reject_twiml(RejectReason::Rejected));
    };
    let incoming = IncomingCall {
        provider_call_id: call_sid.to_string(),
        provider_account_id: params.get("AccountSid").map(str::to_string),
        from_number: params.get("From").unwrap_or_default().to_string(),
        to_number: params.get("To").unwrap_or_default().to_string(),
        status: params.get("CallStatus").map(map_twilio_status),
        at: None,
    };
    match state.orchestrator.handle_incoming_call(incoming).await {
        Ok(routing) => {
            state.prom_metrics.record_webhook(KIND, "applied");
            twiml(routing.twiml)
        }
        Err(e) => {
            // The caller is on the line; voicemail beats dead air.
            error!(call_sid, error = %e, "incoming call routing failed");
            state.prom_metrics.record_webhook(KIND, "error");
            twiml(state.gateway().generate_voicemail_twiml())
        }
    }
}

pub(super) async fn handler_voice_outbound(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "voice-outbound";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let to = query_param(&uri, "to").or_else(|| params.get("To").map(str::to_string));
    let Some(to) = to else {
        state.prom_metrics.record_webhook(KIND, "invalid");
        return twiml(state.gateway().generate_reject_twiml(RejectReason::Rejected));
    };
    match state.orchestrator.outbound_twiml(&to) {
        Ok(doc) => {
            state.prom_metrics.record_webhook(KIND, "applied");
            twiml(doc)
        }
        Err(CallError::Invalid(msg)) => {
            warn!(%msg, "outbound dial refused");
            state.prom_metrics.record_webhook(KIND, "invalid");
            twiml(state.gateway().generate_reject_twiml(RejectReason::Rejected))
        }
        Err(e) => {
            error!(error = %e, "outbound TwiML failed");
            state.prom_metrics.record_webhook(KIND, "error");
            twiml(state.gateway().generate_reject_twiml(RejectReason::Rejected))
        }
    }
}

pub(super) async fn handler_voice_voicemail(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const KIND: &str = "voice-voicemail";
    let params = match verify_webhook(&state, KIND, &uri, &headers, &body) {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let Some(call_sid) = params.get("CallSid") else {
        state.prom_metrics.record_webhook(KIND, "invalid");
        return twiml(state.gateway().generate_voicemail_twiml());
    };
    match state
        .orchestrator
        .handle_voicemail(call_sid, params.get("DialCallStatus"), None)
        .await
    {
        Ok(doc) => {
            state.prom_metrics.record_webhook(KIND, "applied");
            twiml(doc)
        }
        Err(e) => {
            error!(call_sid, error = %e, "voicemail transition failed");
            state.prom_metrics.record_webhook(KIND, "error");
            twiml(state.gateway().generate_voicemail_twiml())
        }
    }
}
