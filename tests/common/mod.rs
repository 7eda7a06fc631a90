//! Shared test helpers for integration tests.
//!
//! Most suites run against the in-memory registry and a [`FakeGateway`], so
//! they need neither PostgreSQL nor network access. The database suite is
//! gated on `TEST_DATABASE_URL`.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::{Arc, Mutex};
use switchboard::call::{CallDirection, CallStatus};
use switchboard::db::memory::{MemoryContacts, MemoryRegistry};
use switchboard::events::RecordingNotifier;
use switchboard::hub::{self, HubConfig, HubHandle};
use switchboard::orchestrator::{CallOrchestrator, OrchestratorConfig, StatusUpdate};
use switchboard::prom_metrics::Metrics;
use switchboard::server::{self, AppState};
use switchboard::telephony::signature::compute_signature;
use switchboard::telephony::{
    client_identity, InitiatedCall, ProviderCallDetails, ProviderCallStatus, ProviderRecording, TelephonyConfig,
    TelephonyError, TelephonyGateway,
};
use tower::ServiceExt;
use uuid::Uuid;

pub const AUTH_TOKEN: &str = "test-auth-token";
pub const PUBLIC_BASE: &str = "https://crm.example.com";
pub const JWT_SECRET: &str = "test-jwt-secret";

pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests")
}

pub fn telephony_config() -> TelephonyConfig {
    TelephonyConfig {
        account_sid: "ACtest".into(),
        auth_token: AUTH_TOKEN.into(),
        api_key_sid: "SKtest".into(),
        api_key_secret: "key-secret".into(),
        twiml_app_sid: "APtest".into(),
        caller_id: "+15550001111".into(),
        public_base_url: PUBLIC_BASE.into(),
        ..TelephonyConfig::default()
    }
}

/// Provider calls a test can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Initiate { to: String, call_id: Uuid },
    End(String),
    Dtmf(String, String),
    Mute(String, String, bool),
    Hold(String, String, bool),
}

/// Records every network operation and answers with canned results.
pub struct FakeGateway {
    config: TelephonyConfig,
    pub calls: Mutex<Vec<GatewayCall>>,
    /// Provider id handed out by `initiate_call`.
    pub next_sid: Mutex<String>,
    pub fail_initiate: Mutex<bool>,
    /// When set, `initiate_call` delivers the `initiated` status callback to
    /// this orchestrator before answering, like a fast provider does.
    pub early_status: Mutex<Option<Arc<CallOrchestrator>>>,
    /// `created` flag, or the error, of that early callback.
    pub early_outcome: Mutex<Option<Result<bool, String>>>,
}

impl FakeGateway {
    pub fn new(config: TelephonyConfig) -> Self {
        FakeGateway {
            config,
            calls: Mutex::new(Vec::new()),
            next_sid: Mutex::new("CA999".into()),
            fail_initiate: Mutex::new(false),
            early_status: Mutex::new(None),
            early_outcome: Mutex::new(None),
        }
    }

    pub fn recorded(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: GatewayCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TelephonyGateway for FakeGateway {
    fn config(&self) -> &TelephonyConfig {
        &self.config
    }

    async fn initiate_call(
        &self,
        to_number: &str,
        internal_call_id: Uuid,
        user_id: &str,
    ) -> Result<InitiatedCall, TelephonyError> {
        self.push(GatewayCall::Initiate {
            to: to_number.to_string(),
            call_id: internal_call_id,
        });
        if *self.fail_initiate.lock().unwrap() {
            return Err(TelephonyError::Api {
                status: 400,
                code: Some(21211),
                message: "invalid 'To' phone number".into(),
            });
        }
        let sid = self.next_sid.lock().unwrap().clone();
        let early = self.early_status.lock().unwrap().clone();
        if let Some(orchestrator) = early {
            let outcome = orchestrator
                .update_call_status(StatusUpdate {
                    provider_call_id: sid.clone(),
                    call_id: Some(internal_call_id),
                    status: CallStatus::Initiated,
                    at: None,
                    duration_secs: None,
                    direction: Some(CallDirection::Outbound),
                    from_number: Some(self.config.caller_id.clone()),
                    to_number: Some(format!("client:{}", client_identity(user_id))),
                    provider_account_id: Some(self.config.account_sid.clone()),
                })
                .await;
            *self.early_outcome.lock().unwrap() =
                Some(outcome.map(|o| o.created).map_err(|e| e.to_string()));
        }
        Ok(InitiatedCall {
            provider_call_id: sid,
            status: ProviderCallStatus::Queued,
        })
    }

    async fn end_call(&self, provider_call_id: &str) -> Result<(), TelephonyError> {
        self.push(GatewayCall::End(provider_call_id.to_string()));
        Ok(())
    }

    async fn get_call_details(
        &self,
        provider_call_id: &str,
    ) -> Result<ProviderCallDetails, TelephonyError> {
        Ok(ProviderCallDetails {
            sid: provider_call_id.to_string(),
            status: "in-progress".into(),
            direction: None,
            from: None,
            to: None,
            duration: None,
            start_time: None,
            end_time: None,
        })
    }

    async fn get_recording(&self, recording_sid: &str) -> Result<ProviderRecording, TelephonyError> {
        Ok(ProviderRecording {
            sid: recording_sid.to_string(),
            call_sid: None,
            duration: None,
            channels: Some(1),
            status: Some("completed".into()),
            media_url: None,
        })
    }

    async fn delete_recording(&self, _recording_sid: &str) -> Result<(), TelephonyError> {
        Ok(())
    }

    async fn send_dtmf(&self, provider_call_id: &str, digits: &str) -> Result<(), TelephonyError> {
        self.push(GatewayCall::Dtmf(provider_call_id.into(), digits.into()));
        Ok(())
    }

    async fn set_participant_mute(
        &self,
        conference_sid: &str,
        provider_call_id: &str,
        muted: bool,
    ) -> Result<(), TelephonyError> {
        self.push(GatewayCall::Mute(conference_sid.into(), provider_call_id.into(), muted));
        Ok(())
    }

    async fn set_participant_hold(
        &self,
        conference_sid: &str,
        provider_call_id: &str,
        on_hold: bool,
    ) -> Result<(), TelephonyError> {
        self.push(GatewayCall::Hold(conference_sid.into(), provider_call_id.into(), on_hold));
        Ok(())
    }
}

/// Orchestrator over in-memory storage with a notification recorder.
pub struct TestOrchestrator {
    pub orchestrator: Arc<CallOrchestrator>,
    pub registry: Arc<MemoryRegistry>,
    pub contacts: Arc<MemoryContacts>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn orchestrator() -> TestOrchestrator {
    let registry = Arc::new(MemoryRegistry::new());
    let contacts = Arc::new(MemoryContacts::new());
    let gateway = Arc::new(FakeGateway::new(telephony_config()));
    let notifier = Arc::new(RecordingNotifier::new());
    let orchestrator = CallOrchestrator::new(
        registry.clone(),
        gateway.clone(),
        contacts.clone(),
        OrchestratorConfig::default(),
    )
    .with_notifier(notifier.clone());
    TestOrchestrator {
        orchestrator: Arc::new(orchestrator),
        registry,
        contacts,
        gateway,
        notifier,
    }
}

/// Full app wired like production, minus PostgreSQL and Twilio.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub registry: Arc<MemoryRegistry>,
    pub contacts: Arc<MemoryContacts>,
    pub gateway: Arc<FakeGateway>,
    pub hub: HubHandle,
}

pub fn build_app() -> TestApp {
    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(MemoryRegistry::new());
    let contacts = Arc::new(MemoryContacts::new());
    let gateway = Arc::new(FakeGateway::new(telephony_config()));
    let (hub, actions) = hub::spawn(HubConfig::default(), metrics.clone());
    let orchestrator = Arc::new(
        CallOrchestrator::new(
            registry.clone(),
            gateway.clone(),
            contacts.clone(),
            OrchestratorConfig::default(),
        )
        .with_notifier(Arc::new(hub.clone()))
        .with_presence(hub.presence())
        .with_metrics(metrics.clone()),
    );
    tokio::spawn(orchestrator.clone().run_agent_actions(actions));
    let verifier = Arc::new(server::JwtVerifier::new(Some(JWT_SECRET.into()), None));
    let state = AppState::new(orchestrator, hub.clone(), verifier, metrics, None);
    TestApp {
        router: server::build_router(state.clone()),
        state,
        registry,
        contacts,
        gateway,
        hub,
    }
}

/// HS256 bearer token for `user_id`, valid for ten minutes.
pub fn bearer(user_id: &str) -> String {
    let claims = serde_json::json!({
        "sub": user_id,
        "email": format!("{}@example.com", user_id),
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    format!("Bearer {}", token)
}

/// Form body plus the `X-Twilio-Signature` Twilio would send for it.
pub fn signed_form(path_and_query: &str, params: &[(&str, &str)]) -> (String, String) {
    let owned: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let url = format!("{}{}", PUBLIC_BASE, path_and_query);
    let signature = compute_signature(AUTH_TOKEN, &url, &owned);
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    (body, signature)
}

pub fn webhook_request(path_and_query: &str, params: &[(&str, &str)]) -> Request<Body> {
    let (body, signature) = signed_form(path_and_query, params);
    Request::builder()
        .method("POST")
        .uri(path_and_query)
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-twilio-signature", signature)
        .body(Body::from(body))
        .unwrap()
}

/// Send a request and return status plus raw body text.
pub async fn send_raw(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

/// Send a request and parse the body as JSON (`Null` when empty).
pub async fn send(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, body) = send_raw(app, req).await;
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body))
    };
    (status, json)
}

pub fn get(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", bearer(user))
        .body(Body::empty())
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, user: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", bearer(user))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
