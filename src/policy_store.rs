//! Policy store lookup.
//!
//! The policy store answers one question: which namespaces are regulated, and
//! with what opaque limit data. Rules receive it as an injected [`PolicyStore`]
//! so they stay testable without a cluster.
//!
//! Implementations:
//! - [`ConfigMapPolicyStore`]: reads a ConfigMap through the Kubernetes API
//! - [`CachingPolicyStore`]: serves recent snapshots from a bounded TTL cache
//! - [`StaticPolicyStore`]: a fixed snapshot

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::LookupError;

/// Default number of policy sources kept by [`CachingPolicyStore`]
pub const DEFAULT_CACHE_ENTRIES: usize = 16;

/// Location of a policy source (ConfigMap namespace and name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Read-only namespace -> limit data mapping fetched for one evaluation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySnapshot(BTreeMap<String, String>);

impl PolicySnapshot {
    pub fn new(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    /// Whether the namespace is subject to validation
    pub fn contains(&self, namespace: &str) -> bool {
        self.0.contains_key(namespace)
    }

    /// Opaque limit data recorded for a namespace
    pub fn get(&self, namespace: &str) -> Option<&str> {
        self.0.get(namespace).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PolicySnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Display for PolicySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("map[")?;
        for (i, (namespace, data)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:{}", namespace, data)?;
        }
        f.write_str("]")
    }
}

/// Source of policy snapshots.
///
/// The deadline comes from the caller; implementations must give up once it
/// passes and report [`LookupError::Timeout`]. Retries, if any, belong here
/// and not in the rules.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch the snapshot stored under `key`
    async fn get(&self, key: &PolicyKey, deadline: Instant) -> Result<PolicySnapshot, LookupError>;
}

// =============================================================================
// ConfigMap-backed store
// =============================================================================

/// Reads the snapshot from a ConfigMap's `data`
pub struct ConfigMapPolicyStore {
    client: Client,
}

impl ConfigMapPolicyStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PolicyStore for ConfigMapPolicyStore {
    async fn get(&self, key: &PolicyKey, deadline: Instant) -> Result<PolicySnapshot, LookupError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        let started = Instant::now();

        let result = match tokio::time::timeout_at(deadline, api.get(&key.name)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, "Policy store lookup timed out");
                return Err(LookupError::Timeout {
                    key: key.clone(),
                    elapsed: started.elapsed(),
                });
            }
        };

        match result {
            Ok(configmap) => {
                let snapshot = PolicySnapshot::new(configmap.data.unwrap_or_default());
                debug!(key = %key, namespaces = snapshot.len(), "Fetched policy snapshot");
                Ok(snapshot)
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                error!(key = %key, "Policy ConfigMap not found");
                Err(LookupError::NotFound { key: key.clone() })
            }
            Err(e) => {
                error!(key = %key, error = %e, "Policy store request failed");
                let code = match &e {
                    kube::Error::Api(api_err) => Some(api_err.code),
                    _ => None,
                };
                Err(LookupError::Unavailable {
                    key: key.clone(),
                    code,
                })
            }
        }
    }
}

// =============================================================================
// Caching wrapper
// =============================================================================

struct CachedSnapshot {
    fetched_at: Instant,
    snapshot: PolicySnapshot,
}

/// Serves snapshots younger than `ttl` without asking the inner store.
///
/// Failed lookups are never cached. When full, the oldest entry is evicted.
pub struct CachingPolicyStore<S> {
    inner: S,
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<PolicyKey, CachedSnapshot>>,
}

impl<S: PolicyStore> CachingPolicyStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self::with_capacity(inner, ttl, DEFAULT_CACHE_ENTRIES)
    }

    pub fn with_capacity(inner: S, ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner,
            ttl,
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn fresh(&self, key: &PolicyKey) -> Option<PolicySnapshot> {
        let entries = self.entries.read().await;
        let cached = entries.get(key)?;
        (cached.fetched_at.elapsed() < self.ttl).then(|| cached.snapshot.clone())
    }
}

#[async_trait]
impl<S: PolicyStore> PolicyStore for CachingPolicyStore<S> {
    async fn get(&self, key: &PolicyKey, deadline: Instant) -> Result<PolicySnapshot, LookupError> {
        if let Some(snapshot) = self.fresh(key).await {
            return Ok(snapshot);
        }

        let snapshot = self.inner.get(key, deadline).await?;

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, cached)| cached.fetched_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key.clone(),
            CachedSnapshot {
                fetched_at: Instant::now(),
                snapshot: snapshot.clone(),
            },
        );

        Ok(snapshot)
    }
}

// =============================================================================
// Static store
// =============================================================================

/// Always answers with the same snapshot, whatever the key
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyStore {
    snapshot: PolicySnapshot,
}

impl StaticPolicyStore {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self { snapshot }
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn get(&self, _key: &PolicyKey, _deadline: Instant) -> Result<PolicySnapshot, LookupError> {
        Ok(self.snapshot.clone())
    }
}
