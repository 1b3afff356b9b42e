/// Configuration management
use crate::error::{RealtimeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_WS_URL: &str = "ws://localhost:8081/ws";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket endpoint, without the token query parameter
    pub ws_url: String,

    /// Reconnect attempts after an abnormal close before giving up
    pub max_reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,

    /// How long a correlated request may stay outstanding
    pub request_timeout: Duration,

    /// Upper bound on a single connection attempt (TCP + handshake)
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Bearer credential handed to the realtime endpoint
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(RealtimeError::MissingCredential);
        }
        Ok(Self(token))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl Config {
    /// Endpoint URL with the credential attached as `?token=`
    pub fn endpoint_url(&self, credential: &Credential) -> String {
        let sep = if self.ws_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}token={}",
            self.ws_url,
            sep,
            urlencoding::encode(credential.expose())
        )
    }

    /// Endpoint URL safe for logs
    pub fn redacted_url(&self) -> String {
        let sep = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}token=***", self.ws_url, sep)
    }

    /// Create config from command line arguments.
    ///
    /// Returns the config, the acting user id and the credential (if any was
    /// supplied by flag or environment).
    pub fn from_args(args: &[String]) -> Result<(Self, String, Option<Credential>)> {
        if args.len() < 2 {
            return Err(RealtimeError::Config(format!(
                "Usage: {} <user_id> [--ws-url <url>] [--token <token>] [--max-reconnects <n>] [--reconnect-delay-ms <ms>] [--request-timeout-ms <ms>]",
                args.first().map(String::as_str).unwrap_or("marketlink")
            )));
        }

        let user_id = args[1].trim().to_string();
        if user_id.is_empty() || user_id.starts_with("--") {
            return Err(RealtimeError::Config("First argument must be a user id".to_string()));
        }

        let mut config = Config::default();
        let mut token: Option<String> = None;

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1).ok_or_else(|| {
                RealtimeError::Config(format!("{} requires an argument", flag))
            });
            match flag {
                "--ws-url" => {
                    config.ws_url = value?.clone();
                }
                "--token" => {
                    token = Some(value?.clone());
                }
                "--max-reconnects" => {
                    config.max_reconnect_attempts = value?.parse::<u32>().map_err(|_| {
                        RealtimeError::Config("--max-reconnects must be a number".to_string())
                    })?;
                }
                "--reconnect-delay-ms" => {
                    config.reconnect_delay = parse_millis(flag, value?)?;
                }
                "--request-timeout-ms" => {
                    config.request_timeout = parse_millis(flag, value?)?;
                }
                other => {
                    return Err(RealtimeError::Config(format!("Unknown argument: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("MARKETLINK_WS_URL") {
            if !url.trim().is_empty() {
                config.ws_url = url;
            }
        }
        if let Ok(t) = std::env::var("MARKETLINK_TOKEN") {
            if token.is_none() {
                token = Some(t);
            }
        }

        if !(config.ws_url.starts_with("ws://") || config.ws_url.starts_with("wss://")) {
            return Err(RealtimeError::Config(format!(
                "WebSocket URL must start with ws:// or wss://, got {}",
                config.ws_url
            )));
        }

        let credential = token.map(Credential::new).transpose()?;
        Ok((config, user_id, credential))
    }
}

fn parse_millis(flag: &str, raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| RealtimeError::Config(format!("{} must be a number of milliseconds", flag)))
}
