//! Async driver: initial fetch, then watch deltas, pushing snapshots to the consumer.

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kmirror_core::{ListPage, MirrorError, Resource, WatchFeed};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Reconciler, Step};

const UPDATE_QUEUE_CAP: usize = 256;

/// What a consumer receives.
#[derive(Debug, Clone)]
pub enum ListUpdate {
    Items(Vec<Arc<Resource>>),
    Error(MirrorError),
}

/// Result of the initial fetch.
#[derive(Debug, Clone)]
pub enum Seed {
    List(ListPage),
    Object(serde_json::Value),
}

/// Cancellation handle that aborts the driver task. Idempotent.
#[derive(Debug, Default)]
pub struct CancelHandle {
    task: Option<JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool { self.task.is_none() }
}

/// Handle to a running list watch.
pub struct ListWatch {
    pub rx: mpsc::Receiver<ListUpdate>,
    pub cancel: CancelHandle,
    snap: Arc<ArcSwap<Vec<Arc<Resource>>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl ListWatch {
    /// Most recently pushed snapshot.
    pub fn current(&self) -> Arc<Vec<Arc<Resource>>> { self.snap.load_full() }

    /// Bumped on every pushed snapshot; `0` until the initial fetch lands.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

struct Publisher {
    tx: mpsc::Sender<ListUpdate>,
    snap: Arc<ArcSwap<Vec<Arc<Resource>>>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

impl Publisher {
    /// Returns false once the consumer is gone.
    async fn items(&mut self, items: Vec<Arc<Resource>>) -> bool {
        self.snap.store(Arc::new(items.clone()));
        self.epoch = self.epoch.saturating_add(1);
        let _ = self.epoch_tx.send(self.epoch);
        self.tx.send(ListUpdate::Items(items)).await.is_ok()
    }

    async fn error(&mut self, e: MirrorError) -> bool {
        self.tx.send(ListUpdate::Error(e)).await.is_ok()
    }
}

/// Seed from `fetch`, then open the watch at the returned cursor via `open`
/// and apply every frame until the feed ends or the handle is cancelled.
///
/// A failed fetch is pushed as [`ListUpdate::Error`] and the watch is never opened.
pub fn start<F, W, WF>(fetch: F, open: W, max_size: Option<usize>) -> ListWatch
where
    F: Future<Output = Result<Seed, MirrorError>> + Send + 'static,
    W: FnOnce(Option<String>) -> WF + Send + 'static,
    WF: Future<Output = Result<WatchFeed, MirrorError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(UPDATE_QUEUE_CAP);
    let snap = Arc::new(ArcSwap::from_pointee(Vec::new()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let mut out = Publisher { tx, snap: Arc::clone(&snap), epoch_tx, epoch: 0 };

    let task = tokio::spawn(async move {
        let mut rec = Reconciler::new(max_size);
        let first = match fetch.await {
            Ok(Seed::List(page)) => rec.seed(page),
            Ok(Seed::Object(raw)) => match rec.seed_object(raw) {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "list: initial object undecodable");
                    out.error(e).await;
                    return;
                }
            },
            Err(e) => {
                warn!(error = %e, status = ?e.status(), "list: initial fetch failed");
                out.error(e).await;
                return;
            }
        };
        let count = first.len();
        if !out.items(first).await {
            return;
        }
        let cursor = rec.cursor().map(str::to_string);
        info!(items = count, cursor = ?cursor, "list: seeded; opening watch");

        let mut feed = match open(cursor).await {
            Ok(feed) => feed,
            Err(e) => {
                warn!(error = %e, "list: watch open failed");
                out.error(e).await;
                return;
            }
        };
        while let Some(frame) = feed.frames.recv().await {
            let alive = match rec.apply_frame(frame) {
                Step::Push(items) => out.items(items).await,
                Step::Skip => true,
                Step::Error(e) => out.error(e).await,
            };
            if !alive {
                debug!("list: consumer dropped");
                break;
            }
        }
        debug!(epoch = out.epoch, "list: watch feed ended");
    });

    ListWatch { rx, cancel: CancelHandle { task: Some(task) }, snap, epoch_rx }
}
