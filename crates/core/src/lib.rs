//! kmirror core types: resources, watch deltas, subscription keys and errors.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::core::{DynamicObject, TypeMeta};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod auth;
pub mod settings;

pub use auth::{Credentials, StaticCredentials};
pub use settings::Settings;

/// Server-assigned `metadata.uid`.
pub type Uid = String;

/// Watch event type as sent by the API server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
    Bookmark,
    #[serde(other)]
    Unknown,
}

/// A single watch frame: `{ type, object }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEvent {
    /// Missing type is treated as ADDED by the reconciler.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EventType>,
    #[serde(default)]
    pub object: serde_json::Value,
}

/// A mirrored object. The payload stays opaque apart from metadata accessors.
#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    /// Last transition applied to this object by the reconciler.
    #[serde(rename = "actionType", skip_serializing_if = "Option::is_none")]
    pub action_type: Option<EventType>,
    #[serde(flatten)]
    pub object: DynamicObject,
}

impl Resource {
    pub fn from_value(v: serde_json::Value) -> Result<Self, MirrorError> {
        let object: DynamicObject = serde_json::from_value(v)
            .map_err(|e| MirrorError::Protocol(format!("decoding object: {e}")))?;
        Ok(Self { action_type: None, object })
    }

    pub fn uid(&self) -> Option<&str> { self.object.metadata.uid.as_deref() }
    pub fn name(&self) -> Option<&str> { self.object.metadata.name.as_deref() }
    pub fn namespace(&self) -> Option<&str> { self.object.metadata.namespace.as_deref() }
    pub fn resource_version(&self) -> Option<&str> { self.object.metadata.resource_version.as_deref() }
    pub fn kind(&self) -> Option<&str> { self.object.types.as_ref().map(|t| t.kind.as_str()) }

    /// `resourceVersion` as an integer, when it parses as one.
    pub fn version(&self) -> Option<u64> {
        self.resource_version().and_then(|rv| rv.parse::<u64>().ok())
    }

    /// `lastTimestamp` when present (events), otherwise `metadata.creationTimestamp`.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.object
            .data
            .get("lastTimestamp")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| self.object.metadata.creation_timestamp.as_ref().map(|t| t.0))
    }

    /// Set `kind`, keeping an existing apiVersion when the object carries one.
    pub fn stamp_kind(&mut self, kind: &str, api_version: Option<&str>) {
        let api_version = self
            .object
            .types
            .as_ref()
            .map(|t| t.api_version.clone())
            .filter(|v| !v.is_empty())
            .or_else(|| api_version.map(str::to_string))
            .unwrap_or_default();
        self.object.types = Some(TypeMeta { api_version, kind: kind.to_string() });
    }
}

/// `PodList` -> `Pod`.
pub fn item_kind(list_kind: &str) -> &str {
    list_kind.strip_suffix("List").unwrap_or(list_kind)
}

/// Initial list response: `{ kind, apiVersion, items[], metadata: { resourceVersion } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: ListMeta,
}

impl ListPage {
    /// Cursor the watch should resume from.
    pub fn cursor(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }
}

/// Identity of one logical watch: `(cluster, path, query)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub cluster_id: String,
    pub path: String,
    pub query: String,
}

impl SubscriptionKey {
    pub fn new(cluster_id: impl Into<String>, path: impl Into<String>, query: impl Into<String>) -> Self {
        Self { cluster_id: cluster_id.into(), path: path.into(), query: query.into() }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cluster_id, self.path, self.query)
    }
}

/// Decoded transport frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
}

/// Receiving half of a watch transport. Dropping it releases the transport.
pub struct WatchFeed {
    pub frames: mpsc::UnboundedReceiver<Frame>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchFeed {
    pub fn new(frames: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { frames, release: None }
    }

    /// Run `release` once when the feed is dropped.
    pub fn with_release(frames: mpsc::UnboundedReceiver<Frame>, release: impl FnOnce() + Send + 'static) -> Self {
        Self { frames, release: Some(Box::new(release)) }
    }
}

impl Drop for WatchFeed {
    fn drop(&mut self) {
        if let Some(f) = self.release.take() {
            f();
        }
    }
}

/// Errors crossing crate boundaries, delivered to consumers as values.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum MirrorError {
    #[error("request failed ({status}): {message}")]
    Request { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("watch error ({code}) {reason}: {message}")]
    Watch { code: u16, reason: String, message: String },
    #[error("closed")]
    Closed,
}

impl MirrorError {
    pub fn status(&self) -> Option<u16> {
        match self {
            MirrorError::Request { status, .. } => Some(*status),
            MirrorError::Watch { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Build from the `Status` object carried by an ERROR watch event.
    pub fn from_status(object: &serde_json::Value) -> Self {
        let s = |k: &str| object.get(k).and_then(|v| v.as_str()).unwrap_or("").to_string();
        let code = object.get("code").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
        MirrorError::Watch { code, reason: s("reason"), message: s("message") }
    }
}

pub mod prelude {
    pub use super::{DeltaEvent, EventType, Frame, ListPage, MirrorError, Resource, SubscriptionKey, Uid, WatchFeed};
}
