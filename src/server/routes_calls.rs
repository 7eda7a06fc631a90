//! Agent-facing call API. Every route requires a bearer token; calls are
//! scoped to their owner or assigned agent.

use super::middleware_auth::RequireAuth;
use super::{error_response, AppState};
use crate::call::{CallDirection, CallStatus};
use crate::db::{CallDetails, CallFilter, Page, StatsRange, DEFAULT_PER_PAGE};
use crate::orchestrator::InitiateCall;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub(super) async fn handler_token(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
) -> Response {
    match state
        .orchestrator
        .generate_token(&user.user_id, user.email.as_deref())
    {
        Ok(token) => Json(token).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_calls_create(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Json(req): Json<InitiateCall>,
) -> Response {
    match state
        .orchestrator
        .initiate_call(&user.user_id, user.email.as_deref(), req)
        .await
    {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ListQuery {
    direction: Option<CallDirection>,
    status: Option<CallStatus>,
    contact_id: Option<i64>,
    deal_id: Option<i64>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    search: Option<String>,
    include_deleted: Option<bool>,
    page: Option<i64>,
    per_page: Option<i64>,
}

impl ListQuery {
    fn split(self) -> (CallFilter, Page) {
        let page = Page {
            page: self.page.unwrap_or(1),
            per_page: self.per_page.unwrap_or(DEFAULT_PER_PAGE),
        };
        let filter = CallFilter {
            direction: self.direction,
            status: self.status,
            contact_id: self.contact_id,
            deal_id: self.deal_id,
            from: self.from,
            to: self.to,
            search: self.search,
            include_deleted: self.include_deleted.unwrap_or(false),
        };
        (filter, page)
    }
}

pub(super) async fn handler_calls_list(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Query(query): Query<ListQuery>,
) -> Response {
    let (filter, page) = query.split();
    match state
        .orchestrator
        .list_calls(&user.user_id, &filter, page)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct StatsQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    /// Team-wide totals instead of the caller's own calls.
    #[serde(default)]
    all: bool,
}

pub(super) async fn handler_calls_stats(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Query(query): Query<StatsQuery>,
) -> Response {
    let owner = (!query.all).then_some(user.user_id.as_str());
    let range = StatsRange {
        from: query.from,
        to: query.to,
    };
    match state.orchestrator.get_call_stats(owner, range).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_call_get(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orchestrator.get_call(id, &user.user_id).await {
        Ok(call) => Json(call).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_call_update(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
    Json(details): Json<CallDetails>,
) -> Response {
    match state
        .orchestrator
        .update_call_details(id, &user.user_id, details)
        .await
    {
        Ok(call) => Json(call).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_call_delete(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orchestrator.delete_call(id, &user.user_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_call_restore(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orchestrator.restore_call(id, &user.user_id).await {
        Ok(call) => Json(call).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_call_end(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orchestrator.end_call(id, &user.user_id).await {
        Ok(call) => Json(call).into_response(),
        Err(e) => error_response(e),
    }
}

pub(super) async fn handler_call_events(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orchestrator.list_call_events(id, &user.user_id).await {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct DtmfRequest {
    digits: String,
}

pub(super) async fn handler_call_dtmf(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path(id): Path<Uuid>,
    Json(req): Json<DtmfRequest>,
) -> Response {
    match state
        .orchestrator
        .send_dtmf(id, &user.user_id, &req.digits)
        .await
    {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct MuteRequest {
    muted: bool,
}

pub(super) async fn handler_participant_mute(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path((id, participant_id)): Path<(Uuid, i64)>,
    Json(req): Json<MuteRequest>,
) -> Response {
    match state
        .orchestrator
        .set_participant_mute(id, &user.user_id, participant_id, req.muted)
        .await
    {
        Ok(p) => Json(p).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct HoldRequest {
    on_hold: bool,
}

pub(super) async fn handler_participant_hold(
    State(state): State<Arc<AppState>>,
    RequireAuth(user): RequireAuth,
    Path((id, participant_id)): Path<(Uuid, i64)>,
    Json(req): Json<HoldRequest>,
) -> Response {
    match state
        .orchestrator
        .set_participant_hold(id, &user.user_id, participant_id, req.on_hold)
        .await
    {
        Ok(p) => Json(p).into_response(),
        Err(e) => error_response(e),
    }
}

/// Roster from the hub's latest presence snapshot.
pub(super) async fn handler_agents(
    State(state): State<Arc<AppState>>,
    RequireAuth(_user): RequireAuth,
) -> Response {
    let snapshot = state.hub.snapshot();
    Json(json!({
        "agents": snapshot.agents,
        "available": snapshot.available_count(),
        "pendingCalls": snapshot.pending_calls,
    }))
    .into_response()
}
