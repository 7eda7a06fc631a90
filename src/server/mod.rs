//! # Server: HTTP, Webhooks and the Agent Socket
//!
//! Axum router exposing three surfaces over one [`AppState`]:
//!
//! - provider webhooks and TwiML fetch endpoints (signature-verified)
//! - the bearer-authenticated call API and `/socket/calls`
//! - operational probes and Prometheus metrics
//!
//! Every request runs inside a `request` span tagged with an `x-request-id`
//! (propagated when the caller sends one) and is timed into the latency
//! histogram under a normalized path.

pub(crate) mod middleware_auth;
mod routes_calls;
mod routes_health;
mod routes_voice;
mod routes_webhooks;
mod websocket;

use crate::config::Config;
use crate::db::{memory::MemoryContacts, memory::MemoryRegistry, CallRegistry, Database};
use crate::hub::{self, HubHandle};
use crate::orchestrator::{CallError, CallOrchestrator, ContactLookup, OrchestratorConfig};
use crate::prom_metrics::{self, Metrics};
use crate::telephony::{TelephonyError, TelephonyGateway, TwilioGateway};
use anyhow::Result;
use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Instrument};

pub use middleware_auth::{AuthUser, JwtVerifier, TokenVerifier};

pub struct AppState {
    pub orchestrator: Arc<CallOrchestrator>,
    pub hub: HubHandle,
    pub verifier: Arc<dyn TokenVerifier>,
    pub prom_metrics: Arc<Metrics>,
    /// `None` when running on the in-memory registry.
    pub database: Option<Database>,
    pub body_limit_bytes: usize,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<CallOrchestrator>,
        hub: HubHandle,
        verifier: Arc<dyn TokenVerifier>,
        prom_metrics: Arc<Metrics>,
        database: Option<Database>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            orchestrator,
            hub,
            verifier,
            prom_metrics,
            database,
            body_limit_bytes: 1024 * 1024,
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Wire registry, gateway, hub and orchestrator from config, and start the
    /// agent-action pump.
    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let (registry, contacts, database): (
            Arc<dyn CallRegistry>,
            Arc<dyn ContactLookup>,
            Option<Database>,
        ) = match config.server.database_url.as_deref() {
            Some(url) => {
                let db = Database::connect(url).await?;
                db.migrate().await?;
                info!("connected to PostgreSQL");
                (Arc::new(db.clone()), Arc::new(db.clone()), Some(db))
            }
            None => {
                warn!("DATABASE_URL not set, using in-memory call registry");
                (
                    Arc::new(MemoryRegistry::new()),
                    Arc::new(MemoryContacts::new()),
                    None,
                )
            }
        };
        let gateway: Arc<dyn TelephonyGateway> =
            Arc::new(TwilioGateway::new(config.telephony.clone())?);
        if !gateway.is_configured() {
            warn!("telephony credentials missing, outbound calls and tokens disabled");
        }
        if config.telephony.skip_signature_validation {
            warn!("webhook signature validation disabled");
        }

        let (hub, actions) = hub::spawn(config.hub.clone(), metrics.clone());
        let orchestrator = Arc::new(
            CallOrchestrator::new(
                registry,
                gateway,
                contacts,
                OrchestratorConfig {
                    fallback_owner_id: config.hub.fallback_owner_id.clone(),
                },
            )
            .with_notifier(Arc::new(hub.clone()))
            .with_presence(hub.presence())
            .with_metrics(metrics.clone()),
        );
        tokio::spawn(orchestrator.clone().run_agent_actions(actions));

        if config.auth.jwt_secret.is_none() {
            warn!("JWT secret not set, bearer tokens are decoded without verification");
        }
        let verifier = Arc::new(JwtVerifier::new(
            config.auth.jwt_secret.clone(),
            config.auth.audience.clone(),
        ));
        Ok(Arc::new(AppState {
            orchestrator,
            hub,
            verifier,
            prom_metrics: metrics,
            database,
            body_limit_bytes: config.server.body_limit_bytes,
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
        }))
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn TelephonyGateway> {
        self.orchestrator.gateway()
    }
}

/// JSON error body with the status the error class maps to.
pub(crate) fn error_response(e: CallError) -> Response {
    let status = match &e {
        CallError::NotFound(_) => StatusCode::NOT_FOUND,
        CallError::InvalidState { .. } => StatusCode::CONFLICT,
        CallError::Invalid(_) => StatusCode::BAD_REQUEST,
        CallError::Provider(TelephonyError::NotConfigured) => StatusCode::SERVICE_UNAVAILABLE,
        CallError::Provider(_) => StatusCode::BAD_GATEWAY,
        CallError::Registry(err) => {
            error!(error = %err, "registry failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Middleware that records HTTP request duration into the Prometheus histogram,
/// generates (or propagates) a request ID for correlation, and wraps the
/// request in a tracing span using `.instrument()` for proper async propagation.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    let duration = start.elapsed().as_secs_f64();
    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(duration);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Normalize URL path to collapse high-cardinality segments (UUIDs, numeric IDs)
/// into placeholders, preventing histogram label explosion.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            if seg.is_empty() {
                seg.to_string()
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id".to_string()
            } else if seg.len() == 36 && seg.chars().filter(|c| *c == '-').count() == 4 {
                ":uuid".to_string()
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/socket/calls", get(websocket::handler_ws))
        // Provider callbacks
        .route(
            crate::telephony::STATUS_CALLBACK_PATH,
            post(routes_webhooks::handler_status_callback),
        )
        .route(
            crate::telephony::RECORDING_CALLBACK_PATH,
            post(routes_webhooks::handler_recording_callback),
        )
        .route(
            crate::telephony::TRANSCRIPTION_CALLBACK_PATH,
            post(routes_webhooks::handler_transcription_callback),
        )
        .route(
            crate::telephony::CONFERENCE_CALLBACK_PATH,
            post(routes_webhooks::handler_conference_callback),
        )
        .route(
            crate::telephony::VOICE_INCOMING_PATH,
            post(routes_voice::handler_voice_incoming),
        )
        .route(
            crate::telephony::VOICE_OUTBOUND_PATH,
            post(routes_voice::handler_voice_outbound),
        )
        .route(
            crate::telephony::VOICE_VOICEMAIL_PATH,
            post(routes_voice::handler_voice_voicemail),
        )
        // Agent API
        .route("/api/telephony/token", get(routes_calls::handler_token))
        .route(
            "/api/calls",
            get(routes_calls::handler_calls_list).post(routes_calls::handler_calls_create),
        )
        .route("/api/calls/stats", get(routes_calls::handler_calls_stats))
        .route(
            "/api/calls/{id}",
            get(routes_calls::handler_call_get)
                .patch(routes_calls::handler_call_update)
                .delete(routes_calls::handler_call_delete),
        )
        .route(
            "/api/calls/{id}/restore",
            post(routes_calls::handler_call_restore),
        )
        .route("/api/calls/{id}/end", post(routes_calls::handler_call_end))
        .route(
            "/api/calls/{id}/events",
            get(routes_calls::handler_call_events),
        )
        .route("/api/calls/{id}/dtmf", post(routes_calls::handler_call_dtmf))
        .route(
            "/api/calls/{id}/participants/{participant_id}/mute",
            post(routes_calls::handler_participant_mute),
        )
        .route(
            "/api/calls/{id}/participants/{participant_id}/hold",
            post(routes_calls::handler_participant_hold),
        )
        .route("/api/agents", get(routes_calls::handler_agents))
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics));

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(CatchPanicLayer::new())
    .layer(axum::middleware::from_fn_with_state(
        state.clone(),
        metrics_middleware,
    ))
    .layer(TraceLayer::new_for_http())
    .layer(RequestBodyLimitLayer::new(state.body_limit_bytes))
    .layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        state.request_timeout,
    ))
    .with_state(state)
}

pub async fn run(config: Config) -> Result<()> {
    let state = AppState::from_config(&config).await?;
    let app = build_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(port = config.server.port, "switchboard running");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("switchboard shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! { _ = ctrl_c => info!("received SIGINT, shutting down"), _ = sigterm.recv() => info!("received SIGTERM, shutting down") }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler, waiting for SIGINT only");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
