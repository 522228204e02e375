//! kmirror mux: many logical watches over one shared websocket.
//!
//! A single driver task owns the subscription table and the socket. Handles
//! talk to it over a command channel, so the table is never shared. The first
//! listener of a key sends REQUEST; the last one leaving schedules a CLOSE
//! after a debounce so a quick resubscribe does not churn the server.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kmirror_core::{Credentials, Frame, MirrorError, Settings, SubscriptionKey, WatchFeed};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace, warn};

mod connector;
pub mod wire;

pub use connector::{Connector, Link, WsConnector};
pub use wire::WireMessage;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub url: String,
    /// Quiet period before an abandoned key is closed.
    pub debounce: Duration,
    pub reconnect_delay: Duration,
}

impl MuxConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self { url: s.multiplexer_url(), debounce: s.mux_debounce, reconnect_delay: s.mux_reconnect }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Open,
    /// Socket dropped while listeners remain; a retry is scheduled.
    Reconnecting,
}

/// Point-in-time view of the driver, sorted by key.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxStats {
    pub state: ConnState,
    /// Keys with at least one listener.
    pub active: Vec<SubscriptionKey>,
    /// Keys the server reported COMPLETE for on the current socket.
    pub completed: Vec<SubscriptionKey>,
}

enum Command {
    Subscribe {
        key: SubscriptionKey,
        tx: mpsc::UnboundedSender<Frame>,
        reply: oneshot::Sender<Result<u64, MirrorError>>,
    },
    Unsubscribe { key: SubscriptionKey, id: u64 },
    Stats { reply: oneshot::Sender<MuxStats> },
}

/// Cloneable handle to a running multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    cmd: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnState>,
}

impl Multiplexer {
    /// Multiplexer over the real websocket endpoint derived from `settings`.
    pub fn new(settings: &Settings, creds: Arc<dyn Credentials>) -> Self {
        Self::spawn(MuxConfig::from_settings(settings), creds, Arc::new(WsConnector))
    }

    pub fn spawn(cfg: MuxConfig, creds: Arc<dyn Credentials>, connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        let driver = Driver {
            cfg,
            creds,
            connector,
            records: FxHashMap::default(),
            waiters: Vec::new(),
            closes: DelayQueue::new(),
            link_tx: None,
            link_rx: None,
            connecting: None,
            reconnect_at: None,
            state_tx,
            next_id: 0,
        };
        tokio::spawn(driver.run(cmd_rx));
        Self { cmd: cmd_tx, state: state_rx }
    }

    /// Register a listener for `key`. Resolves once the shared socket is open;
    /// failed attempts are retried every `reconnect_delay` in the meantime.
    /// Dropping the future withdraws the listener.
    pub async fn subscribe(&self, key: SubscriptionKey) -> Result<Subscription, MirrorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd
            .send(Command::Subscribe { key: key.clone(), tx, reply: reply_tx })
            .map_err(|_| MirrorError::Closed)?;
        let id = reply_rx.await.map_err(|_| MirrorError::Closed)??;
        Ok(Subscription { rx, guard: Guard { cmd: self.cmd.clone(), key, id, active: true } })
    }

    pub async fn stats(&self) -> Result<MuxStats, MirrorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd.send(Command::Stats { reply }).map_err(|_| MirrorError::Closed)?;
        rx.await.map_err(|_| MirrorError::Closed)
    }

    pub fn state(&self) -> ConnState { *self.state.borrow() }
    pub fn subscribe_state(&self) -> watch::Receiver<ConnState> { self.state.clone() }
}

/// One listener. Dropping it (or calling [`Subscription::cancel`]) unregisters.
pub struct Subscription {
    pub rx: mpsc::UnboundedReceiver<Frame>,
    guard: Guard,
}

impl Subscription {
    pub fn key(&self) -> &SubscriptionKey { &self.guard.key }

    /// Idempotent.
    pub fn cancel(&mut self) { self.guard.release(); }

    /// Hand the frames to a reconciler; the listener lives as long as the feed.
    pub fn into_feed(self) -> WatchFeed {
        let Subscription { rx, guard } = self;
        WatchFeed::with_release(rx, move || drop(guard))
    }
}

struct Guard {
    cmd: mpsc::UnboundedSender<Command>,
    key: SubscriptionKey,
    id: u64,
    active: bool,
}

impl Guard {
    fn release(&mut self) {
        if std::mem::take(&mut self.active) {
            let _ = self.cmd.send(Command::Unsubscribe { key: self.key.clone(), id: self.id });
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) { self.release(); }
}

#[derive(Default)]
struct Record {
    listeners: Vec<(u64, mpsc::UnboundedSender<Frame>)>,
    completed: bool,
    close_at: Option<delay_queue::Key>,
}

struct Waiter {
    key: SubscriptionKey,
    id: u64,
    reply: oneshot::Sender<Result<u64, MirrorError>>,
}

struct Driver {
    cfg: MuxConfig,
    creds: Arc<dyn Credentials>,
    connector: Arc<dyn Connector>,
    records: FxHashMap<SubscriptionKey, Record>,
    waiters: Vec<Waiter>,
    closes: DelayQueue<SubscriptionKey>,
    link_tx: Option<mpsc::UnboundedSender<String>>,
    link_rx: Option<mpsc::UnboundedReceiver<String>>,
    connecting: Option<JoinHandle<Result<Link, MirrorError>>>,
    reconnect_at: Option<Instant>,
    state_tx: watch::Sender<ConnState>,
    next_id: u64,
}

async fn join_connect(h: &mut Option<JoinHandle<Result<Link, MirrorError>>>) -> Result<Link, MirrorError> {
    match h.as_mut() {
        Some(h) => h.await.unwrap_or_else(|e| Err(MirrorError::Transport(e.to_string()))),
        None => std::future::pending().await,
    }
}

async fn recv_link(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        info!(url = %self.cfg.url, debounce_ms = %self.cfg.debounce.as_millis(), "mux: driver started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(c) => self.command(c),
                    None => break,
                },
                res = join_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connect(res);
                }
                msg = recv_link(&mut self.link_rx), if self.link_rx.is_some() => match msg {
                    Some(text) => self.on_text(&text),
                    None => self.on_link_closed(),
                },
                Some(expired) = std::future::poll_fn(|cx| self.closes.poll_expired(cx)), if !self.closes.is_empty() => {
                    self.on_close_due(expired.into_inner());
                }
                _ = tokio::time::sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.prune_waiters();
                    self.drop_idle_records();
                    if self.has_listeners() {
                        counter!("mux_reconnects_total", 1);
                        self.ensure_connecting();
                    } else {
                        self.set_state(ConnState::Disconnected);
                    }
                }
            }
        }
        if let Some(h) = self.connecting.take() {
            h.abort();
        }
        info!("mux: driver stopped");
    }

    fn is_open(&self) -> bool { self.link_tx.is_some() }

    fn has_listeners(&self) -> bool { self.records.values().any(|r| !r.listeners.is_empty()) }

    fn set_state(&self, s: ConnState) {
        self.state_tx.send_if_modified(|cur| {
            let changed = *cur != s;
            *cur = s;
            changed
        });
    }

    fn send(&self, msg: &WireMessage) -> bool {
        let Some(tx) = &self.link_tx else { return false };
        if tx.send(msg.encode()).is_err() {
            warn!("mux: socket writer gone; message dropped");
            return false;
        }
        true
    }

    fn send_request(&self, key: &SubscriptionKey) {
        let msg = WireMessage::request(key, self.creds.user_id(), self.creds.token(&key.cluster_id));
        if self.send(&msg) {
            counter!("mux_requests_sent_total", 1);
            debug!(%key, "mux: REQUEST sent");
        }
    }

    fn send_close(&self, key: &SubscriptionKey) {
        if self.send(&WireMessage::close(key, self.creds.user_id())) {
            counter!("mux_closes_sent_total", 1);
            debug!(%key, "mux: CLOSE sent");
        }
    }

    fn command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { key, tx, reply } => self.subscribe(key, tx, reply),
            Command::Unsubscribe { key, id } => self.unsubscribe(&key, id),
            Command::Stats { reply } => {
                let mut active: Vec<_> =
                    self.records.iter().filter(|(_, r)| !r.listeners.is_empty()).map(|(k, _)| k.clone()).collect();
                let mut completed: Vec<_> = self.records.iter().filter(|(_, r)| r.completed).map(|(k, _)| k.clone()).collect();
                active.sort();
                completed.sort();
                let _ = reply.send(MuxStats { state: *self.state_tx.borrow(), active, completed });
            }
        }
    }

    fn subscribe(&mut self, key: SubscriptionKey, tx: mpsc::UnboundedSender<Frame>, reply: oneshot::Sender<Result<u64, MirrorError>>) {
        let id = self.next_id;
        self.next_id += 1;
        let open = self.is_open();
        let is_new = !self.records.contains_key(&key);
        let rec = self.records.entry(key.clone()).or_default();
        if let Some(k) = rec.close_at.take() {
            self.closes.remove(&k);
            trace!(%key, "mux: pending CLOSE cancelled");
        }
        rec.listeners.push((id, tx));
        let resend = is_new || rec.completed;

        if open {
            if resend {
                rec.completed = false;
                self.send_request(&key);
            }
            if reply.send(Ok(id)).is_err() {
                self.unsubscribe(&key, id);
            }
            return;
        }
        // REQUEST goes out for every listened key once the socket opens.
        self.waiters.push(Waiter { key, id, reply });
        self.reconnect_at = None;
        self.ensure_connecting();
    }

    fn unsubscribe(&mut self, key: &SubscriptionKey, id: u64) {
        let Some(rec) = self.records.get_mut(key) else { return };
        rec.listeners.retain(|(lid, _)| *lid != id);
        if !rec.listeners.is_empty() {
            return;
        }
        let debounce = self.cfg.debounce;
        match rec.close_at {
            Some(k) => self.closes.reset(&k, debounce),
            None => rec.close_at = Some(self.closes.insert(key.clone(), debounce)),
        }
        trace!(%key, "mux: last listener left; CLOSE scheduled");
    }

    fn on_close_due(&mut self, key: SubscriptionKey) {
        let Some(rec) = self.records.get_mut(&key) else { return };
        rec.close_at = None;
        if !rec.listeners.is_empty() {
            return;
        }
        let completed = rec.completed;
        self.records.remove(&key);
        if self.is_open() && !completed {
            self.send_close(&key);
        }
    }

    fn ensure_connecting(&mut self) {
        if self.is_open() || self.connecting.is_some() {
            return;
        }
        self.set_state(ConnState::Connecting);
        let connector = Arc::clone(&self.connector);
        let url = self.cfg.url.clone();
        debug!(%url, "mux: connecting");
        self.connecting = Some(tokio::spawn(async move { connector.connect(&url).await }));
    }

    fn on_connect(&mut self, res: Result<Link, MirrorError>) {
        self.prune_waiters();
        self.drop_idle_records();
        match res {
            Ok(link) => {
                if !self.has_listeners() {
                    debug!(url = %self.cfg.url, "mux: socket opened with nobody listening; dropping it");
                    self.set_state(ConnState::Disconnected);
                    return;
                }
                self.link_tx = Some(link.tx);
                self.link_rx = Some(link.rx);
                self.set_state(ConnState::Open);
                let mut keys: Vec<_> = self.records.keys().cloned().collect();
                keys.sort();
                info!(url = %self.cfg.url, keys = keys.len(), "mux: socket open");
                for key in &keys {
                    if let Some(rec) = self.records.get_mut(key) {
                        rec.completed = false;
                    }
                    self.send_request(key);
                }
                for w in std::mem::take(&mut self.waiters) {
                    if w.reply.send(Ok(w.id)).is_err() {
                        self.unsubscribe(&w.key, w.id);
                    }
                }
            }
            Err(e) => {
                warn!(url = %self.cfg.url, error = %e, waiting = self.waiters.len(), "mux: connect failed");
                self.schedule_reconnect();
            }
        }
    }

    /// Forget subscribers that stopped waiting for the socket.
    fn prune_waiters(&mut self) {
        let (gone, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters).into_iter().partition(|w| w.reply.is_closed());
        self.waiters = live;
        for w in gone {
            if let Some(rec) = self.records.get_mut(&w.key) {
                rec.listeners.retain(|(lid, _)| *lid != w.id);
            }
            trace!(key = %w.key, "mux: pending subscriber went away");
        }
    }

    /// Drop keys without listeners along with any CLOSE still queued for them.
    /// Only valid while no socket is open: such keys were never requested on the next one.
    fn drop_idle_records(&mut self) {
        let closes = &mut self.closes;
        self.records.retain(|_, r| {
            if !r.listeners.is_empty() {
                return true;
            }
            if let Some(k) = r.close_at.take() {
                closes.remove(&k);
            }
            false
        });
    }

    fn on_link_closed(&mut self) {
        warn!(url = %self.cfg.url, "mux: socket closed");
        self.link_tx = None;
        self.link_rx = None;
        for rec in self.records.values_mut() {
            rec.completed = false;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.has_listeners() {
            self.reconnect_at = Some(Instant::now() + self.cfg.reconnect_delay);
            self.set_state(ConnState::Reconnecting);
        } else {
            self.set_state(ConnState::Disconnected);
        }
    }

    fn on_text(&mut self, text: &str) {
        counter!("mux_frames_in_total", 1);
        let msg: WireMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "mux: dropping unparsable frame");
                return;
            }
        };
        let Some(key) = msg.key() else {
            warn!("mux: frame without clusterId or path");
            return;
        };
        match msg {
            WireMessage::Complete { .. } => {
                let Some(rec) = self.records.get_mut(&key) else { return };
                rec.completed = true;
                debug!(%key, "mux: COMPLETE");
                self.send_close(&key);
            }
            WireMessage::Data { data, .. } => {
                let Some(rec) = self.records.get(&key) else {
                    trace!(%key, "mux: DATA for unknown key");
                    return;
                };
                if rec.completed {
                    trace!(%key, "mux: DATA after COMPLETE dropped");
                    return;
                }
                let value = match wire::payload(data) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(%key, error = %e, "mux: dropping DATA payload");
                        return;
                    }
                };
                for (id, tx) in &rec.listeners {
                    if tx.send(Frame::Json(value.clone())).is_err() {
                        debug!(%key, listener = id, "mux: listener gone");
                    }
                }
            }
            WireMessage::Request { .. } | WireMessage::Close { .. } => {
                trace!(%key, "mux: ignoring client-bound frame type");
            }
        }
    }
}
