//! Namespaced key-value storage used for caches, idempotence and negotiation state
//!
//! The federation keeps all cross-request state (cached public keys, activity
//! idempotence records, remote document cache, signature spec memory) behind
//! this small abstraction so deployments can plug in Redis, Postgres or any
//! other backend. [MemoryKvStore] is the in-process default.

use crate::error::Error;
use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use serde_json::Value;
use std::time::{Duration, Instant};

/// A hierarchical storage key: one or more string components.
///
/// Backends see the key JSON-encoded as an array, which keeps arbitrary
/// component values unambiguous (`["publicKey","https://a/b"]`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KvKey(Vec<String>);

impl KvKey {
    /// Create a key from components. At least one component is required.
    pub fn new<I, S>(components: I) -> Result<KvKey, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        if components.is_empty() {
            return Err(Error::UrlVerification("kv key must not be empty"));
        }
        Ok(KvKey(components))
    }

    /// Return a new key with `component` appended.
    pub fn join(&self, component: impl Into<String>) -> KvKey {
        let mut components = self.0.clone();
        components.push(component.into());
        KvKey(components)
    }

    /// The canonical string form handed to backends.
    pub fn as_storage_key(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// Pluggable key-value backend with optional per-entry TTL.
///
/// Writes are last-writer-wins per key; no multi-key transactions are needed
/// by the federation.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value stored under `key`, if present and unexpired.
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, Error>;
    /// Store `value` under `key`. With a TTL the entry disappears after the
    /// duration elapses; without one it lives until overwritten or deleted.
    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<(), Error>;
    /// Remove the entry under `key`, if any.
    async fn delete(&self, key: &KvKey) -> Result<(), Error>;
}

/// Key prefixes for the namespaces the federation maintains in the KV store.
#[derive(Clone, Debug)]
pub struct KvPrefixes {
    /// Records of already-dispatched `(actor, activity)` tuples.
    pub activity_idempotence: KvKey,
    /// Cached remote public keys (including negative entries).
    pub public_key: KvKey,
    /// Cached remote JSON-LD documents.
    pub remote_document: KvKey,
    /// Remembered HTTP message signature spec per origin.
    pub http_message_signatures_spec: KvKey,
}

impl Default for KvPrefixes {
    fn default() -> Self {
        KvPrefixes {
            activity_idempotence: KvKey(vec![
                "_fedikit".into(),
                "activityIdempotence".into(),
            ]),
            public_key: KvKey(vec!["_fedikit".into(), "publicKey".into()]),
            remote_document: KvKey(vec!["_fedikit".into(), "remoteDocument".into()]),
            http_message_signatures_spec: KvKey(vec![
                "_fedikit".into(),
                "httpMessageSignaturesSpec".into(),
            ]),
        }
    }
}

#[derive(Clone)]
struct MemoryEntry {
    value: Value,
    ttl: Option<Duration>,
}

struct PerEntryExpiry;

impl Expiry<String, MemoryEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }
}

/// In-process [KvStore] backed by a `moka` cache with per-entry expiration.
pub struct MemoryKvStore {
    cache: Cache<String, MemoryEntry>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        MemoryKvStore {
            cache: Cache::builder()
                .max_capacity(100_000)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Value>, Error> {
        Ok(self
            .cache
            .get(&key.as_storage_key())
            .await
            .map(|entry| entry.value))
    }

    async fn set(&self, key: &KvKey, value: Value, ttl: Option<Duration>) -> Result<(), Error> {
        // A zero TTL means "do not store" rather than "store forever".
        if ttl == Some(Duration::ZERO) {
            return Ok(());
        }
        self.cache
            .insert(key.as_storage_key(), MemoryEntry { value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> Result<(), Error> {
        self.cache.invalidate(&key.as_storage_key()).await;
        Ok(())
    }
}
