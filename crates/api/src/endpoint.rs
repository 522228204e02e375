//! Resource endpoints and query parameters.

use std::collections::BTreeMap;

use kmirror_core::MirrorError;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// A served resource collection, e.g. `apps/v1 deployments`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiEndpoint {
    /// Empty for the core group.
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespaced: bool,
}

impl ApiEndpoint {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>, namespaced: bool) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into(), namespaced }
    }

    /// From an `apiVersion` string: `v1` or `apps/v1`.
    pub fn from_api_version(api_version: &str, resource: impl Into<String>, namespaced: bool) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, resource, namespaced),
            None => Self::new("", api_version, resource, namespaced),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    fn prefix(&self) -> String {
        if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }

    /// Collection path; the namespace is ignored for cluster-scoped resources.
    pub fn collection_path(&self, namespace: Option<&str>) -> String {
        match namespace.filter(|ns| self.namespaced && !ns.is_empty()) {
            Some(ns) => format!("{}/namespaces/{}/{}", self.prefix(), ns, self.resource),
            None => format!("{}/{}", self.prefix(), self.resource),
        }
    }

    pub fn object_path(&self, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", self.collection_path(namespace), name)
    }
}

/// Query parameters shared by the list request and the watch that follows it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: BTreeMap<String, String>,
}

impl QueryParams {
    pub fn new() -> Self { Self::default() }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn label_selector(self, s: impl Into<String>) -> Self { self.set("labelSelector", s) }
    pub fn field_selector(self, s: impl Into<String>) -> Self { self.set("fieldSelector", s) }
    pub fn limit(self, n: usize) -> Self { self.set("limit", n.to_string()) }
    pub fn resource_version(self, rv: impl Into<String>) -> Self { self.set("resourceVersion", rv) }
    pub fn watch(self) -> Self { self.set("watch", "1") }

    pub fn get(&self, key: &str) -> Option<&str> { self.params.get(key).map(String::as_str) }

    /// Parsed `limit`; drives the reconciler's `max_size`.
    pub fn max_size(&self) -> Option<usize> { self.get("limit").and_then(|s| s.parse().ok()) }

    pub fn is_empty(&self) -> bool { self.params.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// `<base>/clusters/<cluster><path>?<query>`, percent-encoded.
pub fn cluster_url(base: &str, cluster: &str, path: &str, query: &QueryParams) -> Result<Url, MirrorError> {
    let raw = format!("{}/clusters/{}{}", base.trim_end_matches('/'), cluster, path);
    let mut url = Url::parse(&raw).map_err(|e| MirrorError::Protocol(format!("bad url {raw}: {e}")))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter());
    }
    Ok(url)
}
