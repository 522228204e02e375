//! Runtime settings read from `KMIRROR_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Path of the shared multiplexer socket, relative to the websocket base.
pub const MULTIPLEXER_ENDPOINT: &str = "wsMultiplexer";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP base of the backend proxy, e.g. `http://localhost:4466`.
    pub base_url: String,
    pub request_timeout: Duration,
    /// Fixed backoff between raw stream reconnects.
    pub stream_retry: Duration,
    /// Quiet period before a CLOSE is sent for an abandoned subscription.
    pub mux_debounce: Duration,
    pub mux_reconnect: Duration,
    /// Share one socket across watches instead of one socket per watch.
    pub multiplexer: bool,
    pub user_id: Option<String>,
    pub token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4466".to_string(),
            request_timeout: Duration::from_secs(120),
            stream_retry: Duration::from_secs(3),
            mux_debounce: Duration::from_millis(100),
            mux_reconnect: Duration::from_millis(3000),
            multiplexer: false,
            user_id: None,
            token: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: std::env::var("KMIRROR_BASE_URL").unwrap_or(d.base_url),
            request_timeout: env_parse("KMIRROR_REQUEST_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.request_timeout),
            stream_retry: env_parse("KMIRROR_STREAM_RETRY_SECS").map(Duration::from_secs).unwrap_or(d.stream_retry),
            mux_debounce: env_parse("KMIRROR_MUX_DEBOUNCE_MS").map(Duration::from_millis).unwrap_or(d.mux_debounce),
            mux_reconnect: env_parse("KMIRROR_MUX_RECONNECT_MS").map(Duration::from_millis).unwrap_or(d.mux_reconnect),
            multiplexer: env_flag("KMIRROR_MULTIPLEXER").unwrap_or(d.multiplexer),
            user_id: std::env::var("KMIRROR_USER_ID").ok().filter(|s| !s.is_empty()),
            token: std::env::var("KMIRROR_TOKEN").ok().filter(|s| !s.is_empty()),
        }
    }

    /// `http(s)://…` -> `ws(s)://…`, without a trailing slash.
    pub fn ws_base(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match base.strip_prefix("http") {
            Some(rest) => format!("ws{rest}"),
            None => base.to_string(),
        }
    }

    pub fn multiplexer_url(&self) -> String {
        format!("{}/{}", self.ws_base(), MULTIPLEXER_ENDPOINT)
    }
}
