//! Twilio Access Tokens for the browser voice SDK.
//!
//! An access token is an HS256 JWT signed with an API key secret. Twilio
//! identifies it by the `cty: twilio-fpa;v=1` header and reads the voice
//! grant from the `grants` claim.

use super::{TelephonyConfig, TelephonyError};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

pub const ACCESS_TOKEN_CONTENT_TYPE: &str = "twilio-fpa;v=1";
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Browser client identity for a user. Incoming TwiML dials this name.
pub fn client_identity(user_id: &str) -> String {
    format!("user_{}", user_id)
}

/// Inverse of [`client_identity`], for `From=client:user_<id>` parameters.
pub fn user_id_from_identity(identity: &str) -> Option<&str> {
    identity
        .strip_prefix("client:")
        .unwrap_or(identity)
        .strip_prefix("user_")
        .filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingGrant {
    pub allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingGrant {
    pub application_sid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VoiceGrant {
    pub incoming: IncomingGrant,
    pub outgoing: OutgoingGrant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grants {
    pub identity: String,
    pub voice: VoiceGrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub jti: String,
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub grants: Grants,
}

/// A signed token plus what the browser needs alongside it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub identity: String,
    pub expires_at: DateTime<Utc>,
}

/// Sign a voice access token for `user_id`. `ttl` defaults to one hour.
pub fn generate(
    config: &TelephonyConfig,
    user_id: &str,
    ttl: Option<Duration>,
    now: DateTime<Utc>,
) -> Result<AccessToken, TelephonyError> {
    if config.api_key_sid.is_empty()
        || config.api_key_secret.is_empty()
        || config.account_sid.is_empty()
        || config.twiml_app_sid.is_empty()
    {
        return Err(TelephonyError::NotConfigured);
    }

    let ttl = ttl.unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_TTL_SECS));
    let iat = now.timestamp();
    let expires_at = now + ttl;
    let identity = client_identity(user_id);

    let claims = AccessTokenClaims {
        jti: format!("{}-{}", config.api_key_sid, iat),
        iss: config.api_key_sid.clone(),
        sub: config.account_sid.clone(),
        iat,
        nbf: iat,
        exp: expires_at.timestamp(),
        grants: Grants {
            identity: identity.clone(),
            voice: VoiceGrant {
                incoming: IncomingGrant { allow: true },
                outgoing: OutgoingGrant {
                    application_sid: config.twiml_app_sid.clone(),
                },
            },
        },
    };

    let mut header = Header::new(Algorithm::HS256);
    header.cty = Some(ACCESS_TOKEN_CONTENT_TYPE.to_string());

    let token = encode(
        &header,
        &claims,
        &EncodingKey::from_secret(config.api_key_secret.as_bytes()),
    )
    .map_err(|e| TelephonyError::Token(e.to_string()))?;

    Ok(AccessToken {
        token,
        identity,
        expires_at,
    })
}
