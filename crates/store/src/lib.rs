//! kmirror store: resource table and watch reconciler.
//!
//! [`Reconciler`] is a synchronous state machine over a [`ResourceTable`];
//! [`start`] drives it from an initial fetch plus a watch feed.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use kmirror_core::{item_kind, DeltaEvent, EventType, Frame, ListPage, MirrorError, Resource, Uid};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

mod driver;

pub use driver::{start, CancelHandle, ListUpdate, ListWatch, Seed};

/// Latest object per uid, iterated in first-insertion order.
#[derive(Default)]
pub struct ResourceTable {
    map: FxHashMap<Uid, Arc<Resource>>,
    order: VecDeque<Uid>,
}

impl ResourceTable {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn get(&self, uid: &str) -> Option<&Arc<Resource>> { self.map.get(uid) }

    /// Insert or replace; a replaced object keeps its position.
    pub fn upsert(&mut self, uid: Uid, r: Resource) {
        if !self.map.contains_key(&uid) {
            self.order.push_back(uid.clone());
        }
        self.map.insert(uid, Arc::new(r));
    }

    pub fn remove(&mut self, uid: &str) -> bool {
        if self.map.remove(uid).is_none() {
            return false;
        }
        self.order.retain(|u| u != uid);
        true
    }

    pub fn values(&self) -> Vec<Arc<Resource>> {
        self.order.iter().filter_map(|u| self.map.get(u).cloned()).collect()
    }

    /// Values capped to the `max_size` most recent objects (newest first) when the
    /// cap is exceeded; otherwise table order.
    pub fn snapshot(&self, max_size: Option<usize>) -> Vec<Arc<Resource>> {
        let mut values = self.values();
        match max_size {
            Some(cap) if cap > 0 && values.len() > cap => {
                // Objects without any timestamp sort as oldest.
                values.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
                values.truncate(cap);
                values
            }
            _ => values,
        }
    }
}

/// Outcome of feeding one event to the reconciler.
#[derive(Debug)]
pub enum Step {
    /// Table changed; push these values to the consumer.
    Push(Vec<Arc<Resource>>),
    /// Nothing observable happened.
    Skip,
    /// Server-signalled error; the table is untouched.
    Error(MirrorError),
}

/// Applies list seeds and watch deltas to a [`ResourceTable`].
pub struct Reconciler {
    table: ResourceTable,
    max_size: Option<usize>,
    kind: Option<String>,
    api_version: Option<String>,
    cursor: Option<String>,
}

impl Reconciler {
    pub fn new(max_size: Option<usize>) -> Self {
        Self { table: ResourceTable::new(), max_size, kind: None, api_version: None, cursor: None }
    }

    pub fn table(&self) -> &ResourceTable { &self.table }

    /// Latest resourceVersion seen (list metadata, applied events or bookmarks).
    pub fn cursor(&self) -> Option<&str> { self.cursor.as_deref() }

    /// Seed from a list response and return the first snapshot.
    pub fn seed(&mut self, page: ListPage) -> Vec<Arc<Resource>> {
        let kind = item_kind(&page.kind).to_string();
        self.cursor = page.cursor().map(str::to_string);
        self.api_version = page.api_version.clone();
        let total = page.items.len();
        for raw in page.items {
            let mut r = match Resource::from_value(raw) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "seed: dropping undecodable item");
                    continue;
                }
            };
            let Some(uid) = r.uid().map(str::to_string) else {
                warn!("seed: item missing metadata.uid");
                continue;
            };
            if !kind.is_empty() {
                r.stamp_kind(&kind, self.api_version.as_deref());
            }
            self.table.upsert(uid, r);
        }
        if !kind.is_empty() {
            self.kind = Some(kind);
        }
        debug!(items = total, kept = self.table.len(), cursor = ?self.cursor, "seed: list applied");
        self.table.snapshot(self.max_size)
    }

    /// Seed from a single object GET.
    pub fn seed_object(&mut self, raw: serde_json::Value) -> Result<Vec<Arc<Resource>>, MirrorError> {
        let r = Resource::from_value(raw)?;
        let uid = r.uid().map(str::to_string).ok_or_else(|| MirrorError::Protocol("object missing metadata.uid".into()))?;
        self.kind = r.kind().map(str::to_string);
        self.api_version = r.object.types.as_ref().map(|t| t.api_version.clone());
        self.cursor = r.resource_version().map(str::to_string);
        self.table.upsert(uid, r);
        Ok(self.table.snapshot(self.max_size))
    }

    /// Decode a transport frame into a delta and apply it.
    pub fn apply_frame(&mut self, frame: Frame) -> Step {
        let value = match frame {
            Frame::Json(v) => v,
            Frame::Text(s) => match serde_json::from_str(&s) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "reconcile: dropping unparsable frame");
                    return Step::Skip;
                }
            },
            Frame::Binary(b) => match serde_json::from_slice(&b) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, len = b.len(), "reconcile: dropping unparsable binary frame");
                    return Step::Skip;
                }
            },
        };
        match serde_json::from_value::<DeltaEvent>(value) {
            Ok(ev) => self.apply(ev),
            Err(e) => {
                warn!(error = %e, "reconcile: frame is not a watch event");
                Step::Skip
            }
        }
    }

    pub fn apply(&mut self, ev: DeltaEvent) -> Step {
        let kind = ev.kind.unwrap_or(EventType::Added);
        counter!("reconcile_events_total", 1);
        match kind {
            EventType::Error => {
                warn!(object = %ev.object, "reconcile: error event");
                return Step::Error(MirrorError::from_status(&ev.object));
            }
            EventType::Bookmark => {
                if let Some(rv) = ev.object.pointer("/metadata/resourceVersion").and_then(|v| v.as_str()) {
                    self.cursor = Some(rv.to_string());
                }
                return Step::Skip;
            }
            EventType::Unknown => {
                warn!("reconcile: unknown update type");
                return Step::Skip;
            }
            EventType::Added | EventType::Modified | EventType::Deleted => {}
        }

        let mut r = match Resource::from_value(ev.object) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "reconcile: dropping undecodable object");
                return Step::Skip;
            }
        };
        let Some(uid) = r.uid().map(str::to_string) else {
            warn!(?kind, "reconcile: object missing metadata.uid");
            return Step::Skip;
        };
        r.action_type = Some(kind);
        if r.kind().is_none() {
            if let Some(k) = &self.kind {
                r.stamp_kind(k, self.api_version.as_deref());
            }
        }
        let rv = r.resource_version().map(str::to_string);

        match kind {
            EventType::Modified => {
                if let Some(existing) = self.table.get(&uid) {
                    match (existing.version(), r.version()) {
                        (Some(current), Some(incoming)) if incoming > current => {}
                        (Some(current), Some(incoming)) => {
                            counter!("reconcile_stale_dropped_total", 1);
                            trace!(uid = %uid, current, incoming, "reconcile: stale MODIFIED dropped");
                            return Step::Skip;
                        }
                        _ => {
                            warn!(uid = %uid, "reconcile: missing resourceVersion; MODIFIED dropped");
                            return Step::Skip;
                        }
                    }
                }
                self.table.upsert(uid, r);
            }
            EventType::Deleted => {
                if !self.table.remove(&uid) {
                    trace!(uid = %uid, "reconcile: DELETED for unknown uid");
                    return Step::Skip;
                }
            }
            _ => self.table.upsert(uid, r),
        }
        if rv.is_some() {
            self.cursor = rv;
        }
        Step::Push(self.table.snapshot(self.max_size))
    }
}
