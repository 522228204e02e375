//! Multiplexer wire frames. One JSON text message per frame, tagged by `type`.

use kmirror_core::SubscriptionKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE", rename_all_fields = "camelCase")]
pub enum WireMessage {
    Request {
        #[serde(default)]
        cluster_id: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        query: String,
        /// Empty when the caller is anonymous.
        #[serde(default)]
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Close {
        #[serde(default)]
        cluster_id: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        user_id: String,
    },
    /// `data` is usually a JSON document encoded as a string; an inline object is accepted too.
    Data {
        #[serde(default)]
        cluster_id: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        query: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    Complete {
        #[serde(default)]
        cluster_id: String,
        #[serde(default)]
        path: String,
        #[serde(default)]
        query: String,
    },
}

impl WireMessage {
    pub fn request(key: &SubscriptionKey, user_id: Option<String>, token: Option<String>) -> Self {
        WireMessage::Request {
            cluster_id: key.cluster_id.clone(),
            path: key.path.clone(),
            query: key.query.clone(),
            user_id: user_id.unwrap_or_default(),
            token,
        }
    }

    pub fn close(key: &SubscriptionKey, user_id: Option<String>) -> Self {
        WireMessage::Close {
            cluster_id: key.cluster_id.clone(),
            path: key.path.clone(),
            query: key.query.clone(),
            user_id: user_id.unwrap_or_default(),
        }
    }

    /// Subscription this frame addresses; `None` when clusterId or path is empty.
    pub fn key(&self) -> Option<SubscriptionKey> {
        let (c, p, q) = match self {
            WireMessage::Request { cluster_id, path, query, .. }
            | WireMessage::Close { cluster_id, path, query, .. }
            | WireMessage::Data { cluster_id, path, query, .. }
            | WireMessage::Complete { cluster_id, path, query } => (cluster_id, path, query),
        };
        if c.is_empty() || p.is_empty() {
            return None;
        }
        Some(SubscriptionKey::new(c.as_str(), p.as_str(), q.as_str()))
    }

    pub fn encode(&self) -> String {
        // Plain strings and options only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Decode a DATA payload into a JSON object.
pub fn payload(data: serde_json::Value) -> Result<serde_json::Value, String> {
    let value = match data {
        serde_json::Value::String(s) => serde_json::from_str(&s).map_err(|e| e.to_string())?,
        other => other,
    };
    if value.is_object() {
        Ok(value)
    } else {
        Err("payload is not a JSON object".to_string())
    }
}
