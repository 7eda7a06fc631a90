//! # Telephony: Twilio Voice Gateway
//!
//! Everything that talks to, or speaks the dialect of, the telephony
//! provider: the REST client for call control, access tokens for the browser
//! SDK, TwiML documents, webhook signature checks and the status mapper.
//!
//! The orchestrator depends on the [`TelephonyGateway`] trait. Pure document
//! and signature helpers are provided methods on the trait, driven by
//! [`TelephonyConfig`], so a test double only has to fake the network calls.
//!
//! ## Outbound calls
//!
//! `initiate_call` asks Twilio to ring the agent's browser client first. When
//! the agent picks up, Twilio fetches the outbound voice URL, whose TwiML
//! dials the customer's number with the configured caller id. The provider
//! call id returned is the agent leg, and every status callback refers to it.

pub mod signature;
pub mod status;
pub mod token;
pub mod twiml;

pub use status::{map_twilio_status, ProviderCallStatus};
pub use token::{client_identity, user_id_from_identity, AccessToken};
pub use twiml::RejectReason;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

pub const STATUS_CALLBACK_PATH: &str = "/api/webhooks/telephony/status";
pub const RECORDING_CALLBACK_PATH: &str = "/api/webhooks/telephony/recording";
pub const TRANSCRIPTION_CALLBACK_PATH: &str = "/api/webhooks/telephony/transcription";
pub const CONFERENCE_CALLBACK_PATH: &str = "/api/webhooks/telephony/conference";
pub const VOICE_INCOMING_PATH: &str = "/api/telephony/voice/incoming";
pub const VOICE_OUTBOUND_PATH: &str = "/api/telephony/voice/outbound";
pub const VOICE_VOICEMAIL_PATH: &str = "/api/telephony/voice/voicemail";

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

/// Twilio credentials and call-flow settings. Loaded from the `[telephony]`
/// config section with environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    pub account_sid: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub api_key_sid: String,
    #[serde(skip_serializing)]
    pub api_key_secret: String,
    pub twiml_app_sid: String,
    /// Number presented as caller id on outbound calls.
    pub caller_id: String,
    /// Externally reachable base URL, e.g. `https://crm.example.com`. Used
    /// for callback URLs and for rebuilding the signed webhook URL.
    pub public_base_url: String,
    pub api_base_url: String,
    pub voicemail_greeting: String,
    pub dial_timeout_secs: u32,
    pub voicemail_max_secs: u32,
    pub token_ttl_secs: i64,
    /// Skip webhook signature checks. Development only.
    pub skip_signature_validation: bool,
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        TelephonyConfig {
            account_sid: String::new(),
            auth_token: String::new(),
            api_key_sid: String::new(),
            api_key_secret: String::new(),
            twiml_app_sid: String::new(),
            caller_id: String::new(),
            public_base_url: "http://localhost:7001".to_string(),
            api_base_url: DEFAULT_API_BASE.to_string(),
            voicemail_greeting:
                "Sorry, nobody is available to take your call. Please leave a message after the tone."
                    .to_string(),
            dial_timeout_secs: twiml::DEFAULT_DIAL_TIMEOUT_SECS,
            voicemail_max_secs: 120,
            token_ttl_secs: token::DEFAULT_TOKEN_TTL_SECS,
            skip_signature_validation: false,
        }
    }
}

impl TelephonyConfig {
    /// Account credentials and a caller id are the minimum to place calls.
    pub fn is_configured(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.caller_id.is_empty()
    }

    /// Absolute URL for a path on this server.
    pub fn public_url(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.public_base_url.trim_end_matches('/'),
            path_and_query
        )
    }
}

/// Typed provider failures. Never swallowed; the HTTP layer maps them to 502.
#[derive(Debug, thiserror::Error)]
pub enum TelephonyError {
    #[error("telephony provider not configured")]
    NotConfigured,

    #[error("telephony request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telephony API error {status} (code {code:?}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("access token signing failed: {0}")]
    Token(String),

    #[error("unexpected telephony response: {0}")]
    InvalidResponse(String),
}

/// Result of asking the provider to place a call.
#[derive(Debug, Clone, PartialEq)]
pub struct InitiatedCall {
    pub provider_call_id: String,
    pub status: ProviderCallStatus,
}

/// Provider-side view of a call, from `GET Calls/{sid}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProviderCallDetails {
    pub sid: String,
    pub status: String,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    /// Seconds, as a decimal string.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// Provider-side view of a recording, from `GET Recordings/{sid}`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ProviderRecording {
    pub sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub channels: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<i64>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedCall {
    sid: String,
    status: String,
}

/// The provider operations the orchestrator depends on.
#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    fn config(&self) -> &TelephonyConfig;

    fn is_configured(&self) -> bool {
        self.config().is_configured()
    }

    /// Browser SDK token. `ttl` defaults to the configured lifetime.
    fn generate_access_token(
        &self,
        user_id: &str,
        user_email: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<AccessToken, TelephonyError> {
        debug!(user_id, user_email, "issuing voice access token");
        let ttl = ttl.unwrap_or_else(|| Duration::seconds(self.config().token_ttl_secs));
        token::generate(self.config(), user_id, Some(ttl), chrono::Utc::now())
    }

    fn validate_webhook_signature(
        &self,
        signature: &str,
        url: &str,
        params: &[(String, String)],
    ) -> bool {
        let cfg = self.config();
        if cfg.skip_signature_validation {
            return true;
        }
        signature::validate_signature(&cfg.auth_token, signature, url, params)
    }

    fn generate_outbound_twiml(&self, to_number: &str) -> String {
        let cfg = self.config();
        twiml::outbound(
            to_number,
            &cfg.caller_id,
            &cfg.public_url(RECORDING_CALLBACK_PATH),
        )
    }

    fn generate_incoming_twiml(&self, client_identity: &str) -> String {
        let cfg = self.config();
        twiml::incoming(
            client_identity,
            &cfg.public_url(VOICE_VOICEMAIL_PATH),
            &cfg.public_url(RECORDING_CALLBACK_PATH),
            cfg.dial_timeout_secs,
        )
    }

    fn generate_voicemail_twiml(&self) -> String {
        let cfg = self.config();
        twiml::voicemail(
            &cfg.voicemail_greeting,
            &cfg.public_url(RECORDING_CALLBACK_PATH),
            &cfg.public_url(TRANSCRIPTION_CALLBACK_PATH),
            cfg.voicemail_max_secs,
        )
    }

    fn generate_reject_twiml(&self, reason: RejectReason) -> String {
        twiml::reject(reason)
    }

    async fn initiate_call(
        &self,
        to_number: &str,
        internal_call_id: Uuid,
        user_id: &str,
    ) -> Result<InitiatedCall, TelephonyError>;

    async fn end_call(&self, provider_call_id: &str) -> Result<(), TelephonyError>;

    async fn get_call_details(&self, provider_call_id: &str)
        -> Result<ProviderCallDetails, TelephonyError>;

    async fn get_recording(&self, recording_sid: &str) -> Result<ProviderRecording, TelephonyError>;

    async fn delete_recording(&self, recording_sid: &str) -> Result<(), TelephonyError>;

    async fn send_dtmf(&self, provider_call_id: &str, digits: &str) -> Result<(), TelephonyError>;

    async fn set_participant_mute(
        &self,
        conference_sid: &str,
        provider_call_id: &str,
        muted: bool,
    ) -> Result<(), TelephonyError>;

    async fn set_participant_hold(
        &self,
        conference_sid: &str,
        provider_call_id: &str,
        on_hold: bool,
    ) -> Result<(), TelephonyError>;
}

/// DTMF digits Twilio's `<Play digits>` accepts: keypad symbols and `w` pauses.
pub fn is_valid_dtmf(digits: &str) -> bool {
    !digits.is_empty()
        && digits.len() <= 32
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | 'w' | 'W'))
}

/// Twilio REST client over `reqwest`.
pub struct TwilioGateway {
    config: TelephonyConfig,
    http: reqwest::Client,
}

impl TwilioGateway {
    pub fn new(config: TelephonyConfig) -> Result<Self, TelephonyError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(TwilioGateway { config, http })
    }

    fn account_url(&self, resource: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid,
            resource
        )
    }

    fn ensure_configured(&self) -> Result<(), TelephonyError> {
        if self.config.is_configured() {
            Ok(())
        } else {
            Err(TelephonyError::NotConfigured)
        }
    }

    /// Send an authenticated request and turn non-2xx responses into `Api` errors.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TelephonyError> {
        self.ensure_configured()?;
        let response = request
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let parsed: Option<ApiErrorBody> = serde_json::from_str(&body).ok();
        let (code, message) = match parsed {
            Some(err) => (err.code, err.message.unwrap_or(body)),
            None => (None, body),
        };
        warn!(status = status.as_u16(), ?code, %message, "twilio API error");
        Err(TelephonyError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, TelephonyError> {
        let response = self.send(request).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| TelephonyError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl TelephonyGateway for TwilioGateway {
    fn config(&self) -> &TelephonyConfig {
        &self.config
    }

    async fn initiate_call(
        &self,
        to_number: &str,
        internal_call_id: Uuid,
        user_id: &str,
    ) -> Result<InitiatedCall, TelephonyError> {
        let agent = format!("client:{}", client_identity(user_id));
        let voice_url = self.config.public_url(&format!(
            "{}?to={}&callId={}",
            VOICE_OUTBOUND_PATH,
            urlencoding::encode(to_number),
            internal_call_id
        ));
        let status_callback = self.config.public_url(&format!(
            "{}?callId={}",
            STATUS_CALLBACK_PATH, internal_call_id
        ));
        let recording_callback = self.config.public_url(&format!(
            "{}?callId={}",
            RECORDING_CALLBACK_PATH, internal_call_id
        ));
        let form = [
            ("To", agent.as_str()),
            ("From", self.config.caller_id.as_str()),
            ("Url", voice_url.as_str()),
            ("Method", "POST"),
            ("StatusCallback", status_callback.as_str()),
            ("StatusCallbackMethod", "POST"),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
            ("RecordingStatusCallback", recording_callback.as_str()),
            ("RecordingStatusCallbackMethod", "POST"),
        ];
        let created: CreatedCall = self
            .send_json(self.http.post(self.account_url("Calls.json")).form(&form))
            .await?;
        debug!(call_id = %internal_call_id, provider_call_id = %created.sid, "twilio call created");
        Ok(InitiatedCall {
            provider_call_id: created.sid,
            status: ProviderCallStatus::parse(&created.status),
        })
    }

    async fn end_call(&self, provider_call_id: &str) -> Result<(), TelephonyError> {
        let url = self.account_url(&format!("Calls/{}.json", provider_call_id));
        self.send(self.http.post(url).form(&[("Status", "completed")]))
            .await?;
        Ok(())
    }

    async fn get_call_details(
        &self,
        provider_call_id: &str,
    ) -> Result<ProviderCallDetails, TelephonyError> {
        let url = self.account_url(&format!("Calls/{}.json", provider_call_id));
        self.send_json(self.http.get(url)).await
    }

    async fn get_recording(&self, recording_sid: &str) -> Result<ProviderRecording, TelephonyError> {
        let url = self.account_url(&format!("Recordings/{}.json", recording_sid));
        let mut recording: ProviderRecording = self.send_json(self.http.get(url)).await?;
        if recording.media_url.is_none() {
            recording.media_url = Some(self.account_url(&format!("Recordings/{}.mp3", recording.sid)));
        }
        Ok(recording)
    }

    async fn delete_recording(&self, recording_sid: &str) -> Result<(), TelephonyError> {
        let url = self.account_url(&format!("Recordings/{}.json", recording_sid));
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    /// Plays the digits on the leg, which replaces that leg's running TwiML.
    async fn send_dtmf(&self, provider_call_id: &str, digits: &str) -> Result<(), TelephonyError> {
        if !is_valid_dtmf(digits) {
            return Err(TelephonyError::InvalidResponse(format!(
                "invalid DTMF digits '{}'",
                digits
            )));
        }
        let twiml = format!(
            r#"<Response><Play digits="{}"/></Response>"#,
            twiml::escape_xml(digits)
        );
        let url = self.account_url(&format!("Calls/{}.json", provider_call_id));
        self.send(self.http.post(url).form(&[("Twiml", twiml.as_str())]))
            .await?;
        Ok(())
    }

    async fn set_participant_mute(
        &self,
        conference_sid: &str,
        provider_call_id: &str,
        muted: bool,
    ) -> Result<(), TelephonyError> {
        let url = self.account_url(&format!(
            "Conferences/{}/Participants/{}.json",
            conference_sid, provider_call_id
        ));
        let value = if muted { "true" } else { "false" };
        self.send(self.http.post(url).form(&[("Muted", value)])).await?;
        Ok(())
    }

    async fn set_participant_hold(
        &self,
        conference_sid: &str,
        provider_call_id: &str,
        on_hold: bool,
    ) -> Result<(), TelephonyError> {
        let url = self.account_url(&format!(
            "Conferences/{}/Participants/{}.json",
            conference_sid, provider_call_id
        ));
        let value = if on_hold { "true" } else { "false" };
        self.send(self.http.post(url).form(&[("Hold", value)])).await?;
        Ok(())
    }
}
