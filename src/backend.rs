//! The storage seam between the query pipeline and the key/value store.
//!
//! The pipeline only ever needs two operations: enumerate the services at or
//! beneath a name, and resolve a single reverse-ARPA leaf. Everything else
//! about the store (watches, authentication, clustering) stays on the other
//! side of this trait.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::BackendError;
use crate::path::{path_of, path_prefix_no_wildcard};
use crate::service::{effective_ttl, Service};

/// Read access to service records, consumed by the query pipeline.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Return the services published at `name`.
    ///
    /// With `exact` set, only a leaf at exactly the translated path answers.
    /// Otherwise a directory node expands to the transitive set of leaves
    /// beneath it, filtered by any wildcard labels in `name` and
    /// deduplicated by `(host, port, priority, weight)`.
    async fn records(&self, name: &str, exact: bool) -> Result<Vec<Service>, BackendError>;

    /// Resolve the single leaf for a reverse-ARPA name.
    async fn reverse_record(&self, name: &str) -> Result<Service, BackendError>;
}

/// Check one leaf path against the (possibly wildcarded) query path.
///
/// Both are compared segment by segment from the store root. A `*` in the
/// query matches any single segment; a leaf with fewer segments than the
/// query can never match; a leaf with more segments is a subtree hit.
pub fn leaf_matches(query_segments: &[&str], leaf_segments: &[&str]) -> bool {
    for (i, q) in query_segments.iter().enumerate() {
        let Some(leaf) = leaf_segments.get(i) else {
            return false;
        };
        if *q == "*" {
            continue;
        }
        if !q.eq_ignore_ascii_case(leaf) {
            return false;
        }
    }
    true
}

/// One stored leaf: the raw JSON payload plus the store-level TTL.
#[derive(Debug, Clone)]
struct Leaf {
    value: String,
    node_ttl: u32,
}

#[derive(Debug, Default)]
struct TreeInner {
    leaves: BTreeMap<String, Leaf>,
}

/// An in-process tree store implementing [`Backend`].
///
/// Backs the test suite and the bundled binary's static-catalog mode. Leaves
/// are keyed by full store path; subtree enumeration is a range scan over
/// the sorted keys.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<RwLock<TreeInner>>,
    path_prefix: String,
    default_ttl: u32,
    default_priority: u16,
}

impl MemoryBackend {
    /// Create an empty store for the given anchor segment and read-time
    /// defaults.
    pub fn new(path_prefix: &str, default_ttl: u32, default_priority: u16) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TreeInner::default())),
            path_prefix: path_prefix.to_string(),
            default_ttl,
            default_priority,
        }
    }

    /// Insert a raw JSON payload at `path`, with an optional store-level TTL.
    pub fn insert_raw(&self, path: &str, value: &str, node_ttl: Option<u32>) {
        let mut inner = self.inner.write();
        inner.leaves.insert(
            path.to_string(),
            Leaf {
                value: value.to_string(),
                node_ttl: node_ttl.unwrap_or(0),
            },
        );
    }

    /// Publish a service under the path for `name`.
    pub fn publish(&self, name: &str, service: &Service) {
        let (path, _) = path_of(name, &self.path_prefix);
        let value = serde_json::to_string(service).expect("service serialises");
        self.insert_raw(&path, &value, None);
    }

    /// Remove the leaf at the path for `name`.
    pub fn remove(&self, name: &str) {
        let (path, _) = path_of(name, &self.path_prefix);
        self.inner.write().leaves.remove(&path);
    }

    /// Number of stored leaves.
    pub fn len(&self) -> usize {
        self.inner.read().leaves.len()
    }

    /// True when the store holds no leaves.
    pub fn is_empty(&self) -> bool {
        self.inner.read().leaves.is_empty()
    }

    fn decode(&self, path: &str, leaf: &Leaf) -> Result<Service, BackendError> {
        let mut service: Service = serde_json::from_str(&leaf.value)?;
        service.ttl = effective_ttl(leaf.node_ttl, service.ttl, self.default_ttl);
        if service.priority == 0 {
            service.priority = self.default_priority;
        }
        service.key = path.to_string();
        Ok(service)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn records(&self, name: &str, exact: bool) -> Result<Vec<Service>, BackendError> {
        let (path, wildcard) = path_of(name, &self.path_prefix);
        let inner = self.inner.read();

        // A leaf at exactly the translated path answers for both modes.
        if let Some(leaf) = inner.leaves.get(&path) {
            return Ok(vec![self.decode(&path, leaf)?]);
        }
        if exact {
            return Err(BackendError::NotFound);
        }

        let root = if wildcard {
            path_prefix_no_wildcard(name, &self.path_prefix)
        } else {
            path.clone()
        };
        let query_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let subtree_prefix = format!("{}/", root);
        let mut services = Vec::new();
        let mut seen = HashSet::new();
        let mut found_any = false;
        for (leaf_path, leaf) in inner.leaves.range(subtree_prefix.clone()..) {
            if !leaf_path.starts_with(&subtree_prefix) {
                break;
            }
            found_any = true;
            if wildcard {
                let leaf_segments: Vec<&str> =
                    leaf_path.split('/').filter(|s| !s.is_empty()).collect();
                if !leaf_matches(&query_segments, &leaf_segments) {
                    continue;
                }
            }
            match self.decode(leaf_path, leaf) {
                Ok(service) => {
                    if seen.insert(service.dedup_key()) {
                        services.push(service);
                    }
                }
                Err(err) => {
                    // A malformed leaf is absent for enumeration purposes.
                    debug!(path = %leaf_path, %err, "skipping undecodable leaf");
                }
            }
        }

        if !found_any {
            return Err(BackendError::NotFound);
        }
        Ok(services)
    }

    async fn reverse_record(&self, name: &str) -> Result<Service, BackendError> {
        let (path, _) = path_of(name, &self.path_prefix);
        let inner = self.inner.read();
        let leaf = inner.leaves.get(&path).ok_or(BackendError::NotFound)?;
        self.decode(&path, leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new("skydns", 3600, 10)
    }

    fn host(h: &str) -> Service {
        Service {
            host: h.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exact_leaf_lookup() {
        let b = backend();
        b.publish("a.skydns.test.", &host("10.0.0.1"));

        let records = b.records("a.skydns.test.", true).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].host, "10.0.0.1");
        assert_eq!(records[0].key, "/skydns/test/skydns/a");
        assert_eq!(records[0].ttl, 3600);
        assert_eq!(records[0].priority, 10);
    }

    #[tokio::test]
    async fn test_exact_miss_is_not_found() {
        let b = backend();
        let err = b.records("missing.skydns.test.", true).await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound));
    }

    #[tokio::test]
    async fn test_directory_enumerates_subtree() {
        let b = backend();
        b.publish("1.web.east.skydns.test.", &host("10.0.0.1"));
        b.publish("2.web.east.skydns.test.", &host("10.0.0.2"));
        b.publish("1.web.west.skydns.test.", &host("10.0.1.1"));

        let records = b.records("east.skydns.test.", false).await.unwrap();
        assert_eq!(records.len(), 2);

        let all = b.records("skydns.test.", false).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_wildcard_matches_single_label() {
        let b = backend();
        b.publish("1.web.east.skydns.test.", &host("10.0.0.1"));
        b.publish("1.web.west.skydns.test.", &host("10.0.1.1"));
        b.publish("1.db.east.skydns.test.", &host("10.0.2.1"));

        let records = b.records("1.web.*.skydns.test.", false).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|s| s.host.starts_with("10.0.")));
    }

    #[tokio::test]
    async fn test_wildcard_skips_shorter_leaves() {
        let b = backend();
        b.publish("web.east.skydns.test.", &host("10.0.0.1"));

        // Query is one label longer than the stored leaf.
        let err = b
            .records("extra.*.east.skydns.test.", false)
            .await
            .map(|r| r.len());
        assert_eq!(err.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dedup_by_endpoint_tuple() {
        let b = backend();
        let svc = Service {
            host: "server1".into(),
            port: 8080,
            ..Default::default()
        };
        b.publish("1.web.east.skydns.test.", &svc);
        b.publish("2.web.east.skydns.test.", &svc);

        let records = b.records("east.skydns.test.", false).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_leaf_is_skipped_in_enumeration() {
        let b = backend();
        b.publish("1.web.east.skydns.test.", &host("10.0.0.1"));
        b.insert_raw("/skydns/test/skydns/east/web/2", "not json", None);

        let records = b.records("east.skydns.test.", false).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_single_leaf_is_decode_error() {
        let b = backend();
        b.insert_raw("/skydns/test/skydns/bad", "not json", None);
        let err = b.records("bad.skydns.test.", false).await.unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn test_node_ttl_caps_service_ttl() {
        let b = backend();
        b.insert_raw(
            "/skydns/test/skydns/short",
            r#"{"host":"10.0.0.1","ttl":300}"#,
            Some(30),
        );
        let records = b.records("short.skydns.test.", true).await.unwrap();
        assert_eq!(records[0].ttl, 30);
    }

    #[tokio::test]
    async fn test_reverse_record() {
        let b = backend();
        b.publish("1.0.0.10.in-addr.arpa.", &host("reverse.example.com"));
        let svc = b.reverse_record("1.0.0.10.in-addr.arpa.").await.unwrap();
        assert_eq!(svc.host, "reverse.example.com");

        let err = b.reverse_record("2.0.0.10.in-addr.arpa.").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound));
    }

    #[test]
    fn test_leaf_matches() {
        let query = ["skydns", "test", "skydns", "*", "web"];
        assert!(leaf_matches(
            &query,
            &["skydns", "test", "skydns", "east", "web"]
        ));
        assert!(leaf_matches(
            &query,
            &["skydns", "test", "skydns", "east", "web", "1"]
        ));
        assert!(!leaf_matches(
            &query,
            &["skydns", "test", "skydns", "east", "db"]
        ));
        assert!(!leaf_matches(&query, &["skydns", "test", "skydns", "east"]));
    }
}
