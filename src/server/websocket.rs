//! `/socket/calls`: agent presence and live call events.
//!
//! The bearer token is checked before the upgrade (`?token=` or the
//! `Authorization` header). After that the connection is a thin pump: hub
//! frames out, parsed client events in.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use super::middleware_auth::{bearer_token, AuthUser};
use super::AppState;
use crate::hub::protocol::{ClientEvent, ServerEvent};

#[derive(Debug, Default, Deserialize)]
pub(super) struct SocketQuery {
    token: Option<String>,
}

/// Authentication is checked before the upgrade headers, so a missing token
/// is always a 401.
pub(super) async fn handler_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));
    let Some(user) = token.and_then(|t| state.verifier.verify(t)) else {
        debug!("socket handshake without a valid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Authentication required"})),
        )
            .into_response();
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| ws_loop(socket, state, user))
}

async fn ws_loop(mut socket: WebSocket, state: Arc<AppState>, user: AuthUser) {
    let Some(mut conn) = state.hub.connect(&user.user_id, user.email.clone()).await else {
        return;
    };
    info!(conn_id = conn.id, user_id = %user.user_id, "socket opened");

    loop {
        tokio::select! {
            outbound = conn.rx.recv() => {
                let Some(event) = outbound else { break };
                let Some(text) = event.to_json() else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match ClientEvent::parse(text.as_str()) {
                        Ok(event) => state.hub.client_event(conn.id, event).await,
                        Err(e) => {
                            debug!(conn_id = conn.id, error = %e, "unparseable client frame");
                            let reply = ServerEvent::Error {
                                message: format!("invalid frame: {}", e),
                            };
                            if let Some(text) = reply.to_json() {
                                if socket.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.hub.disconnect(conn.id).await;
    info!(conn_id = conn.id, user_id = %user.user_id, "socket closed");
}
