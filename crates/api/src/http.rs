//! Initial list/get requests through the backend proxy.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use kmirror_core::{Credentials, MirrorError, Settings};
use metrics::histogram;
use reqwest::header::HeaderMap;
use reqwest::Url;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::endpoint::{cluster_url, QueryParams};

pub const RELOAD_HEADER: &str = "X-Reload";
pub const AUTHORIZATION_HEADER: &str = "X-Authorization";

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    base: String,
    creds: Arc<dyn Credentials>,
    reload: Arc<watch::Sender<u64>>,
}

impl HttpFetcher {
    pub fn new(settings: &Settings, creds: Arc<dyn Credentials>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .context("building http client")?;
        let (reload, _) = watch::channel(0u64);
        Ok(Self { client, base: settings.base_url.clone(), creds, reload: Arc::new(reload) })
    }

    /// Bumped every time the backend asks the embedder to reload.
    pub fn subscribe_reload(&self) -> watch::Receiver<u64> { self.reload.subscribe() }

    pub fn url(&self, cluster: &str, path: &str, query: &QueryParams) -> Result<Url, MirrorError> {
        cluster_url(&self.base, cluster, path, query)
    }

    /// GET a JSON document for `cluster`.
    pub async fn get_json(&self, cluster: &str, path: &str, query: &QueryParams) -> Result<serde_json::Value, MirrorError> {
        let url = self.url(cluster, path, query)?;
        if let Err(e) = self.creds.refresh_token(cluster).await {
            warn!(cluster, error = %e, "http: token refresh failed; using stored token");
        }
        let mut req = self.client.get(url.clone());
        if let Some(token) = self.creds.token(cluster) {
            req = req.bearer_auth(token);
        }

        let t0 = Instant::now();
        let resp = req.send().await.map_err(transport_error)?;
        self.handle_signals(cluster, resp.headers());
        let status = resp.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("").to_string();
            let body: Option<serde_json::Value> = resp.json().await.ok();
            let message = match body.as_ref().and_then(|b| b.get("message")).and_then(|m| m.as_str()) {
                Some(m) => format!("{reason} - {m}"),
                None => reason,
            };
            warn!(%url, status = status.as_u16(), %message, "http: request failed");
            return Err(MirrorError::Request { status: status.as_u16(), message });
        }
        let value = resp.json::<serde_json::Value>().await.map_err(|e| {
            if e.is_timeout() {
                transport_error(e)
            } else {
                MirrorError::Protocol(format!("decoding {url}: {e}"))
            }
        })?;
        let ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("http_list_ms", ms);
        info!(%url, took_ms = %(ms as u64), "http: ok");
        Ok(value)
    }

    fn handle_signals(&self, cluster: &str, headers: &HeaderMap) {
        let reload = headers
            .get(RELOAD_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("reload"));
        if reload {
            debug!(cluster, "http: backend requested reload");
            self.reload.send_modify(|n| *n = n.saturating_add(1));
        }
        if let Some(token) = headers.get(AUTHORIZATION_HEADER).and_then(|v| v.to_str().ok()) {
            let token = token.strip_prefix("Bearer ").unwrap_or(token);
            if !token.is_empty() {
                debug!(cluster, "http: refreshed token stored");
                self.creds.set_token(cluster, token);
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> MirrorError {
    if e.is_timeout() {
        MirrorError::Request { status: 408, message: "Request timed out".into() }
    } else {
        MirrorError::Request { status: 502, message: format!("Network error: {e}") }
    }
}
