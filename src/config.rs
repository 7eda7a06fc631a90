//! # Config: TOML File Plus CLI/Environment Overrides
//!
//! ```toml
//! [server]
//! port = 7001
//! database_url = "postgres://localhost/crm"
//!
//! [telephony]
//! account_sid = "AC..."
//! caller_id = "+15550001111"
//! public_base_url = "https://crm.example.com"
//!
//! [hub]
//! fallback_owner_id = "admin"
//!
//! [auth]
//! audience = "authenticated"
//! ```
//!
//! Precedence is CLI flag / environment variable, then the file, then the
//! built-in defaults. Secrets are normally supplied through the environment.

use crate::hub::HubConfig;
use crate::telephony::TelephonyConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub hub: HubConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Unset means the in-memory registry.
    pub database_url: Option<String>,
    pub body_limit_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 7001,
            database_url: None,
            body_limit_bytes: 1024 * 1024,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 secret for bearer tokens. Unset decodes without verification
    /// (development only).
    pub jwt_secret: Option<String>,
    pub audience: Option<String>,
}

/// Values that override the file. Each maps to a flag and an env var.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// PostgreSQL connection URL; omit for the in-memory registry
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "TWILIO_ACCOUNT_SID")]
    pub account_sid: Option<String>,

    #[arg(long, env = "TWILIO_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    #[arg(long, env = "TWILIO_API_KEY")]
    pub api_key_sid: Option<String>,

    #[arg(long, env = "TWILIO_API_SECRET", hide_env_values = true)]
    pub api_key_secret: Option<String>,

    #[arg(long, env = "TWILIO_TWIML_APP_SID")]
    pub twiml_app_sid: Option<String>,

    /// Caller id for outbound calls
    #[arg(long, env = "TWILIO_PHONE_NUMBER")]
    pub caller_id: Option<String>,

    /// Externally reachable base URL used for callbacks and signature checks
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: Option<String>,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Agent that owns inbound calls when nobody is online
    #[arg(long, env = "FALLBACK_OWNER_ID")]
    pub fallback_owner_id: Option<String>,
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("invalid config file")
    }

    /// Read `path` if given, else start from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                Self::from_toml_str(&content)
            }
            None => Ok(Config::default()),
        }
    }

    pub fn apply(&mut self, o: &ConfigOverrides) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }
        set(&mut self.server.port, &o.port);
        if o.database_url.is_some() {
            self.server.database_url = o.database_url.clone();
        }
        set(&mut self.telephony.account_sid, &o.account_sid);
        set(&mut self.telephony.auth_token, &o.auth_token);
        set(&mut self.telephony.api_key_sid, &o.api_key_sid);
        set(&mut self.telephony.api_key_secret, &o.api_key_secret);
        set(&mut self.telephony.twiml_app_sid, &o.twiml_app_sid);
        set(&mut self.telephony.caller_id, &o.caller_id);
        set(&mut self.telephony.public_base_url, &o.public_base_url);
        if o.jwt_secret.is_some() {
            self.auth.jwt_secret = o.jwt_secret.clone();
        }
        set(&mut self.hub.fallback_owner_id, &o.fallback_owner_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.server.port, 7001);
        assert!(cfg.server.database_url.is_none());
        assert_eq!(cfg.hub.fallback_owner_id, "admin");
        assert_eq!(cfg.telephony.dial_timeout_secs, 20);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            [server]
            port = 8080

            [telephony]
            caller_id = "+15550001111"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.server.request_timeout_secs, 30);
        assert_eq!(cfg.telephony.caller_id, "+15550001111");
        assert_eq!(cfg.telephony.public_base_url, "http://localhost:7001");
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hub]\noutbound_capacity = 8\nfallback_owner_id = \"ops\"").unwrap();
        let cfg = Config::load(Some(file.path())).unwrap();
        assert_eq!(cfg.hub.outbound_capacity, 8);
        assert_eq!(cfg.hub.fallback_owner_id, "ops");
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = Config::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("cannot read config file"));
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[server\nport = ").is_err());
    }

    #[test]
    fn overrides_win_over_file() {
        let mut cfg = Config::from_toml_str("[server]\nport = 9000\n[auth]\njwt_secret = \"file\"").unwrap();
        cfg.apply(&ConfigOverrides {
            port: Some(7100),
            jwt_secret: Some("env".into()),
            caller_id: Some("+15557654321".into()),
            ..Default::default()
        });
        assert_eq!(cfg.server.port, 7100);
        assert_eq!(cfg.auth.jwt_secret.as_deref(), Some("env"));
        assert_eq!(cfg.telephony.caller_id, "+15557654321");
    }

    #[test]
    fn absent_overrides_keep_file_values() {
        let mut cfg =
            Config::from_toml_str("[server]\ndatabase_url = \"postgres://db/crm\"").unwrap();
        cfg.apply(&ConfigOverrides::default());
        assert_eq!(cfg.server.database_url.as_deref(), Some("postgres://db/crm"));
    }
}
