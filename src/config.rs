use std::time::Duration;

use crate::models::DEFAULT_MODEL;

const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// Client settings, normally read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub model: String,
    /// Bearer token for the backend, if it requires one.
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request timeout for the fallback and the plain REST calls.
    pub request_timeout: Duration,
    /// A stream that stays silent for this long is considered dropped.
    pub stream_idle_timeout: Duration,
    /// Whether a stream that drops after opening gets the one-shot fallback.
    pub fallback_on_stream_drop: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(60),
            fallback_on_stream_drop: false,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Self {
            base_url: lookup("CHAT_API_BASE_URL")
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            model: lookup("CHAT_MODEL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.model),
            auth_token: lookup("CHAT_API_TOKEN").filter(|v| !v.trim().is_empty()),
            connect_timeout: secs("CHAT_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            request_timeout: secs("CHAT_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            stream_idle_timeout: secs("CHAT_STREAM_IDLE_TIMEOUT_SECS", defaults.stream_idle_timeout),
            fallback_on_stream_drop: lookup("CHAT_FALLBACK_ON_STREAM_DROP")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.fallback_on_stream_drop),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
