//! kmirror client facade.
//!
//! Wires the HTTP list fetch, the reconciler and a watch transport into one
//! cancellable [`ListWatch`]. Frontends depend on this crate only.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use kmirror_core::{Credentials, ListPage, MirrorError, Settings, SubscriptionKey, WatchFeed};
use kmirror_mux::Multiplexer;
use kmirror_store::{start, Seed};
use kmirror_stream::StreamRequest;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub mod endpoint;
pub mod http;

pub use endpoint::{cluster_url, ApiEndpoint, QueryParams};
pub use http::HttpFetcher;
pub use kmirror_core::{Frame, Resource, StaticCredentials};
pub use kmirror_store::{CancelHandle, ListUpdate, ListWatch};

/// How watch frames reach the reconciler.
#[derive(Clone)]
pub enum Transport {
    /// One websocket per watch.
    PerWatch,
    /// All watches share one multiplexed socket.
    Shared(Multiplexer),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::PerWatch => "per-watch",
            Transport::Shared(_) => "multiplexer",
        }
    }
}

pub struct Client {
    settings: Settings,
    creds: Arc<dyn Credentials>,
    http: HttpFetcher,
    transport: ArcSwap<Transport>,
}

impl Client {
    /// Transport chosen by `settings.multiplexer`. Must be called inside a tokio runtime.
    pub fn new(settings: Settings, creds: Arc<dyn Credentials>) -> anyhow::Result<Self> {
        let transport = if settings.multiplexer {
            Transport::Shared(Multiplexer::new(&settings, Arc::clone(&creds)))
        } else {
            Transport::PerWatch
        };
        Self::with_transport(settings, creds, transport)
    }

    pub fn with_transport(settings: Settings, creds: Arc<dyn Credentials>, transport: Transport) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(&settings, Arc::clone(&creds))?;
        info!(base = %settings.base_url, transport = transport.name(), "client: ready");
        Ok(Self { settings, creds, http, transport: ArcSwap::from_pointee(transport) })
    }

    /// Applies to watches started afterwards; running watches keep their transport.
    pub fn set_transport(&self, transport: Transport) {
        info!(transport = transport.name(), "client: transport switched");
        self.transport.store(Arc::new(transport));
    }

    pub fn transport(&self) -> Arc<Transport> { self.transport.load_full() }
    pub fn http(&self) -> &HttpFetcher { &self.http }
    pub fn settings(&self) -> &Settings { &self.settings }

    /// List a collection, then keep it current from the watch.
    pub fn watch_list(&self, cluster: &str, endpoint: &ApiEndpoint, namespace: Option<&str>, query: QueryParams) -> ListWatch {
        let path = endpoint.collection_path(namespace);
        let max_size = query.max_size();
        info!(cluster, %path, ?max_size, "client: watch list");

        let fetcher = self.http.clone();
        let (c, p, q) = (cluster.to_string(), path.clone(), query.clone());
        let fetch = async move {
            let raw = fetcher.get_json(&c, &p, &q).await?;
            let page: ListPage = serde_json::from_value(raw).map_err(|e| MirrorError::Protocol(format!("list response: {e}")))?;
            Ok::<_, MirrorError>(Seed::List(page))
        };
        start(fetch, self.opener(cluster, path, query), max_size)
    }

    /// Get one object, then follow it through a name-filtered collection watch.
    pub fn watch_object(
        &self,
        cluster: &str,
        endpoint: &ApiEndpoint,
        namespace: Option<&str>,
        name: &str,
        query: QueryParams,
    ) -> ListWatch {
        let object_path = endpoint.object_path(namespace, name);
        info!(cluster, path = %object_path, "client: watch object");

        let fetcher = self.http.clone();
        let (c, q) = (cluster.to_string(), query.clone());
        let fetch = async move { Ok::<_, MirrorError>(Seed::Object(fetcher.get_json(&c, &object_path, &q).await?)) };
        let watch_query = query.field_selector(format!("metadata.name={name}"));
        start(fetch, self.opener(cluster, endpoint.collection_path(namespace), watch_query), None)
    }

    /// Opens the watch at the reconciler's cursor on the transport current at call time.
    fn opener(
        &self,
        cluster: &str,
        path: String,
        query: QueryParams,
    ) -> impl FnOnce(Option<String>) -> BoxFuture<'static, Result<WatchFeed, MirrorError>> + Send + 'static {
        let target = WatchTarget {
            transport: self.transport.load_full(),
            creds: Arc::clone(&self.creds),
            ws_base: self.settings.ws_base(),
            retry: self.settings.stream_retry,
            cluster: cluster.to_string(),
            path,
            query,
        };
        move |cursor| Box::pin(target.open(cursor))
    }
}

struct WatchTarget {
    transport: Arc<Transport>,
    creds: Arc<dyn Credentials>,
    ws_base: String,
    retry: std::time::Duration,
    cluster: String,
    path: String,
    query: QueryParams,
}

impl WatchTarget {
    async fn open(self, cursor: Option<String>) -> Result<WatchFeed, MirrorError> {
        let mut query = self.query.watch();
        if let Some(rv) = cursor {
            query = query.resource_version(rv);
        }
        let url = cluster_url(&self.ws_base, &self.cluster, &self.path, &query)?;
        match &*self.transport {
            Transport::PerWatch => {
                let (tx, rx) = mpsc::unbounded_channel();
                let req = StreamRequest::new(url.as_str()).cluster(self.cluster.as_str()).json().retry_delay(self.retry);
                let handle = kmirror_stream::connect(req, self.creds, tx, None);
                debug!(%url, "client: raw watch opened");
                Ok(WatchFeed::with_release(rx, move || handle.cancel()))
            }
            Transport::Shared(mux) => {
                let key = SubscriptionKey::new(self.cluster.as_str(), self.path.as_str(), url.query().unwrap_or(""));
                debug!(%key, "client: multiplexed watch opened");
                Ok(mux.subscribe(key).await?.into_feed())
            }
        }
    }
}
