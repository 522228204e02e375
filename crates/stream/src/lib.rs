//! kmirror stream: one websocket per watch endpoint.
//!
//! Credentials travel in the subprotocol list since a browser-compatible
//! handshake cannot carry custom headers. An unexpected close calls the
//! failure hook and, when enabled, reconnects to the same URL after a fixed
//! backoff until cancelled.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use kmirror_core::{Credentials, Frame};
use metrics::counter;
use smallvec::SmallVec;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BINARY_PROTOCOL: &str = "base64.binary.k8s.io";
pub const BEARER_PROTOCOL_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";
pub const USER_PROTOCOL_PREFIX: &str = "base64url.headlamp.authorization.k8s.io.";

/// Subprotocol list: binary marker, caller extras, then bearer token and user id (base64url, unpadded).
pub fn subprotocols(token: Option<&str>, user_id: Option<&str>, extra: &[String]) -> SmallVec<[String; 4]> {
    let mut out: SmallVec<[String; 4]> = SmallVec::new();
    out.push(BINARY_PROTOCOL.to_string());
    out.extend(extra.iter().cloned());
    if let Some(t) = token.filter(|t| !t.is_empty()) {
        out.push(format!("{}{}", BEARER_PROTOCOL_PREFIX, URL_SAFE_NO_PAD.encode(t)));
    }
    if let Some(u) = user_id.filter(|u| !u.is_empty()) {
        out.push(format!("{}{}", USER_PROTOCOL_PREFIX, URL_SAFE_NO_PAD.encode(u)));
    }
    out
}

/// What to connect to and how to treat the stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    /// Cluster whose token is looked up in the credential store.
    pub cluster: String,
    pub protocols: Vec<String>,
    pub is_json: bool,
    /// Defaults to true only when no failure hook is supplied.
    pub reconnect_on_failure: Option<bool>,
    pub retry_delay: Duration,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            cluster: String::new(),
            protocols: Vec::new(),
            is_json: false,
            reconnect_on_failure: None,
            retry_delay: Duration::from_secs(3),
        }
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self { self.cluster = cluster.into(); self }
    pub fn json(mut self) -> Self { self.is_json = true; self }
    pub fn protocol(mut self, p: impl Into<String>) -> Self { self.protocols.push(p.into()); self }
    pub fn reconnect(mut self, on: bool) -> Self { self.reconnect_on_failure = Some(on); self }
    pub fn retry_delay(mut self, d: Duration) -> Self { self.retry_delay = d; self }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Open,
    Closed,
}

/// Called on every unexpected close or failed connect.
pub type FailHook = Box<dyn Fn() + Send + Sync>;

/// Handle returned by [`connect`].
#[derive(Debug, Clone)]
pub struct StreamHandle {
    token: CancellationToken,
    state: watch::Receiver<StreamState>,
}

impl StreamHandle {
    /// Stop the stream; repeated calls are no-ops.
    pub fn cancel(&self) { self.token.cancel(); }
    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// Whether a socket is currently open.
    pub fn is_open(&self) -> bool { *self.state.borrow() == StreamState::Open }
    pub fn state(&self) -> StreamState { *self.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> { self.state.clone() }
}

/// Open a stream. Frames go to `frames`; the loop ends on cancel, when the
/// frame receiver is dropped, or after the first failure if reconnects are off.
pub fn connect(
    req: StreamRequest,
    creds: Arc<dyn Credentials>,
    frames: mpsc::UnboundedSender<Frame>,
    on_fail: Option<FailHook>,
) -> StreamHandle {
    let token = CancellationToken::new();
    let (state_tx, state_rx) = watch::channel(StreamState::Connecting);
    let reconnect = req.reconnect_on_failure.unwrap_or(on_fail.is_none());
    let loop_token = token.clone();

    tokio::spawn(async move {
        let conn_id = Uuid::new_v4();
        info!(url = %req.url, %conn_id, reconnect, "stream: starting");
        loop {
            state_tx.send_replace(StreamState::Connecting);
            let outcome = tokio::select! {
                _ = loop_token.cancelled() => break,
                r = session(&req, creds.as_ref(), &frames, &state_tx, &loop_token) => r,
            };
            state_tx.send_replace(StreamState::Closed);
            if loop_token.is_cancelled() || frames.is_closed() {
                break;
            }
            match outcome {
                Ok(()) => warn!(url = %req.url, %conn_id, "stream: socket closed unexpectedly"),
                Err(e) => warn!(url = %req.url, %conn_id, error = %e, "stream: connect failed"),
            }
            if let Some(hook) = &on_fail {
                hook();
            }
            if !reconnect {
                break;
            }
            debug!(url = %req.url, delay_ms = %req.retry_delay.as_millis(), "stream: reconnecting");
            tokio::select! {
                _ = loop_token.cancelled() => break,
                _ = tokio::time::sleep(req.retry_delay) => {}
            }
            counter!("stream_reconnects_total", 1);
        }
        state_tx.send_replace(StreamState::Closed);
        info!(url = %req.url, %conn_id, "stream: stopped");
    });

    StreamHandle { token, state: state_rx }
}

/// One socket lifetime. `Ok` means the socket closed (or we were told to stop).
async fn session(
    req: &StreamRequest,
    creds: &dyn Credentials,
    frames: &mpsc::UnboundedSender<Frame>,
    state_tx: &watch::Sender<StreamState>,
    token: &CancellationToken,
) -> Result<()> {
    let protocols = subprotocols(creds.token(&req.cluster).as_deref(), creds.user_id().as_deref(), &req.protocols);
    let mut request = req.url.as_str().into_client_request().context("building websocket request")?;
    let header = HeaderValue::from_str(&protocols.join(", ")).context("encoding subprotocols")?;
    request.headers_mut().insert("Sec-WebSocket-Protocol", header);

    let (mut ws, _resp) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("connecting {}", req.url))?;
    state_tx.send_replace(StreamState::Open);
    debug!(url = %req.url, "stream: open");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = ws.close(None).await;
                return Ok(());
            }
            msg = ws.next() => match msg {
                Some(Ok(m)) => {
                    if let Some(frame) = decode(m, req.is_json) {
                        if frames.send(frame).is_err() {
                            let _ = ws.close(None).await;
                            return Ok(());
                        }
                    }
                }
                Some(Err(e)) => return Err(e).context("reading websocket"),
                None => return Ok(()),
            }
        }
    }
}

/// JSON parse failures are logged and the frame dropped.
fn decode(msg: Message, is_json: bool) -> Option<Frame> {
    match msg {
        Message::Text(text) if is_json => match serde_json::from_str(text.as_str()) {
            Ok(v) => Some(Frame::Json(v)),
            Err(e) => {
                warn!(error = %e, "stream: dropping unparsable frame");
                None
            }
        },
        Message::Text(text) => Some(Frame::Text(text.as_str().to_string())),
        Message::Binary(bytes) if is_json => match serde_json::from_slice(&bytes) {
            Ok(v) => Some(Frame::Json(v)),
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "stream: dropping unparsable binary frame");
                None
            }
        },
        Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
        _ => None,
    }
}
