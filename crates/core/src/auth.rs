//! Credential seam. Token acquisition lives outside kmirror; transports only
//! read, refresh and persist what the embedding application provides.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Token store consulted by every transport.
#[async_trait::async_trait]
pub trait Credentials: Send + Sync {
    /// Bearer token for a cluster, if any.
    fn token(&self, cluster: &str) -> Option<String>;

    /// Persist a token handed back by the server (`X-Authorization`).
    fn set_token(&self, cluster: &str, token: &str);

    /// Identifier sent alongside multiplexer frames and as an impersonation subprotocol.
    fn user_id(&self) -> Option<String>;

    /// Invoked before list requests so the embedder can refresh service-account tokens.
    async fn refresh_token(&self, _cluster: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory credentials: a per-cluster map with an optional fallback token.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    tokens: Mutex<HashMap<String, String>>,
    fallback: Option<String>,
    user_id: Option<String>,
}

impl StaticCredentials {
    pub fn new(fallback: Option<String>, user_id: Option<String>) -> Self {
        Self { tokens: Mutex::new(HashMap::new()), fallback, user_id }
    }
}

impl Credentials for StaticCredentials {
    fn token(&self, cluster: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.get(cluster).cloned().or_else(|| self.fallback.clone())
    }

    fn set_token(&self, cluster: &str, token: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        tokens.insert(cluster.to_string(), token.to_string());
    }

    fn user_id(&self) -> Option<String> { self.user_id.clone() }
}
