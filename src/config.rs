//! Configuration management for streamgate
//!
//! Configuration is environment-first: the variables below are the
//! deployment contract, and an optional YAML file can pre-fill the same
//! fields for local runs (environment always wins).
//!
//! - `API_ID`, `API_HASH`: upstream application credentials
//! - `BOT_TOKEN`: primary bot session (id 0, required)
//! - `MULTI_TOKEN<i>`: additional sessions, ids starting from 1
//! - `STRING_SESSION`: optional user session, becomes the power session
//!   (id 99); base64-encoded persisted session bytes
//! - `BIN_CHANNEL`: archive chat identity (required)
//! - `SLEEP_THRESHOLD`: upstream auto-sleep threshold for short waits
//! - `MAX_CONCURRENT_PER_CLIENT`: advisory per-session capacity
//! - `BIND_ADDR`, `PORT`: HTTP listener

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::pool::{Credential, SessionSpec};
use crate::{SessionId, POWER_SESSION_ID, PRIMARY_SESSION_ID};

static MULTI_TOKEN_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^MULTI_TOKEN(\d+)$").expect("token var pattern"));

/// Main configuration structure for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream application id
    #[serde(default)]
    pub api_id: i32,

    /// Upstream application hash
    #[serde(default)]
    pub api_hash: String,

    /// Primary bot token (session 0)
    #[serde(default)]
    pub bot_token: String,

    /// Additional session tokens keyed by id (ids start at 1)
    #[serde(default)]
    pub additional_tokens: BTreeMap<SessionId, String>,

    /// Persisted user session for the power session (id 99)
    #[serde(default)]
    pub string_session: Option<String>,

    /// Archive chat every session reads from
    #[serde(default)]
    pub bin_channel: i64,

    /// Upstream library auto-sleep threshold, in seconds
    #[serde(default = "default_sleep_threshold")]
    pub sleep_threshold: u32,

    /// Advisory concurrent-stream capacity per session
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_client: usize,

    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// HTTP listener and presentation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address of the listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redirect target for `GET /`
    #[serde(default = "default_doc_url")]
    pub doc_url: String,
}

fn default_sleep_threshold() -> u32 {
    60
}

fn default_max_concurrent() -> usize {
    100
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_doc_url() -> String {
    "https://github.com/streamgate/streamgate".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            doc_url: default_doc_url(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            bot_token: String::new(),
            additional_tokens: BTreeMap::new(),
            string_session: None,
            bin_channel: 0,
            sleep_threshold: default_sleep_threshold(),
            max_concurrent_per_client: default_max_concurrent(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)?;
                serde_yaml::from_str(&raw)?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Overlay every recognised environment variable.
    pub fn apply_env(&mut self) {
        if let Some(value) = env_parse::<i32>("API_ID") {
            self.api_id = value;
        }
        if let Ok(value) = std::env::var("API_HASH") {
            self.api_hash = value;
        }
        if let Ok(value) = std::env::var("BOT_TOKEN") {
            self.bot_token = value;
        }
        if let Ok(value) = std::env::var("STRING_SESSION") {
            if !value.is_empty() {
                self.string_session = Some(value);
            }
        }
        if let Some(value) = env_parse::<i64>("BIN_CHANNEL") {
            self.bin_channel = value;
        }
        if let Some(value) = env_parse::<u32>("SLEEP_THRESHOLD") {
            self.sleep_threshold = value;
        }
        if let Some(value) = env_parse::<usize>("MAX_CONCURRENT_PER_CLIENT") {
            self.max_concurrent_per_client = value;
        }
        if let Ok(value) = std::env::var("BIND_ADDR") {
            self.server.bind_addr = value;
        }
        if let Some(value) = env_parse::<u16>("PORT") {
            self.server.port = value;
        }

        for (name, value) in std::env::vars() {
            if let Some(captures) = MULTI_TOKEN_VAR.captures(&name) {
                match captures[1].parse::<SessionId>() {
                    Ok(id) => {
                        self.additional_tokens.insert(id, value);
                    }
                    Err(_) => warn!(var = %name, "ignoring unparseable token variable"),
                }
            }
        }
    }

    /// Validate the assembled configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_id <= 0 {
            return Err(GatewayError::Config("API_ID must be a positive integer".into()));
        }
        if self.api_hash.is_empty() {
            return Err(GatewayError::Config("API_HASH must be set".into()));
        }
        if self.bot_token.is_empty() {
            return Err(GatewayError::Config("BOT_TOKEN must be set".into()));
        }
        if !self.bot_token.contains(':') {
            return Err(GatewayError::Config(
                "BOT_TOKEN does not look like a bot token".into(),
            ));
        }
        if self.bin_channel == 0 {
            return Err(GatewayError::Config("BIN_CHANNEL must be set".into()));
        }
        for id in self.additional_tokens.keys() {
            if *id == PRIMARY_SESSION_ID || *id == POWER_SESSION_ID {
                return Err(GatewayError::Config(format!(
                    "additional token id {id} collides with a reserved session id"
                )));
            }
        }
        if self.max_concurrent_per_client == 0 {
            return Err(GatewayError::Config(
                "MAX_CONCURRENT_PER_CLIENT must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Session specs derived from the credentials: the primary, every
    /// additional token, and the power session when a user session is
    /// configured.
    pub fn session_specs(&self) -> Vec<SessionSpec> {
        let mut specs = vec![SessionSpec {
            id: PRIMARY_SESSION_ID,
            credential: Credential::BotToken(self.bot_token.clone()),
        }];
        for (id, token) in &self.additional_tokens {
            specs.push(SessionSpec {
                id: *id,
                credential: Credential::from_raw(token),
            });
        }
        if let Some(session) = &self.string_session {
            specs.push(SessionSpec {
                id: POWER_SESSION_ID,
                credential: Credential::UserSession(session.clone()),
            });
        }
        specs
    }

    /// `host:port` string for the HTTP listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.bind_addr, self.server.port)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(var = name, "ignoring unparseable environment variable");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            api_id: 12345,
            api_hash: "hash".into(),
            bot_token: "100:abc".into(),
            bin_channel: -1001234,
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sleep_threshold, 60);
        assert_eq!(config.max_concurrent_per_client, 100);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_validation_success() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_requires_credentials() {
        let mut config = valid_config();
        config.api_id = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.api_hash.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.bot_token = "not-a-bot-token".into();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.bin_channel = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_reserved_token_ids() {
        let mut config = valid_config();
        config.additional_tokens.insert(99, "1:x".into());
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.additional_tokens.insert(0, "1:x".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_specs_cover_all_credentials() {
        let mut config = valid_config();
        config.additional_tokens.insert(1, "101:tok1".into());
        config.additional_tokens.insert(2, "102:tok2".into());
        config.string_session = Some("AQAAsession".into());

        let specs = config.session_specs();
        let ids: Vec<SessionId> = specs.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 99]);
        assert_eq!(
            specs[3].credential,
            Credential::UserSession("AQAAsession".into())
        );
    }

    #[test]
    fn test_bind_address() {
        let config = valid_config();
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
    }
}
