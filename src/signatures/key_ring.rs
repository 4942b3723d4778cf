//! Fetching and caching the public keys named by signature `keyid` parameters

use crate::{
    document_loader::DocumentLoader,
    entity::str_or_id,
    error::Error,
    keys::{KeyAlgorithm, PublicKey},
    kv::{KvKey, KvStore},
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use url::Url;

/// Positive cache entries live for six hours.
const KEY_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// Negative entries are kept briefly so a flood of requests signed with a
/// missing key does not hammer the peer.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// A public key resolved from a `keyid` URL.
#[derive(Clone, Debug)]
pub struct FetchedKey {
    /// The key id it was fetched under
    pub key_id: Url,
    /// The actor the key belongs to, when the document names one
    pub owner: Option<Url>,
    /// The key itself
    pub key: PublicKey,
}

/// Resolves `keyid` URLs to public keys through the document loader, with a
/// KV-backed cache including negative entries.
#[derive(Clone)]
pub struct KeyRing {
    loader: Arc<dyn DocumentLoader>,
    kv: Arc<dyn KvStore>,
    prefix: KvKey,
}

impl KeyRing {
    /// Create a key ring over `loader`, caching under `prefix` in `kv`.
    pub fn new(loader: Arc<dyn DocumentLoader>, kv: Arc<dyn KvStore>, prefix: KvKey) -> KeyRing {
        KeyRing { loader, kv, prefix }
    }

    /// Resolve `key_id`, consulting the cache first. Returns the key and
    /// whether it came out of the cache, or `None` when the key cannot be
    /// resolved (including a cached negative entry).
    pub async fn get(&self, key_id: &Url) -> Option<(FetchedKey, bool)> {
        let cache_key = self.prefix.join(key_id.as_str());
        match self.kv.get(&cache_key).await {
            Ok(Some(Value::Null)) => return None,
            Ok(Some(cached)) => {
                if let Some(key) = key_from_cache(key_id, &cached) {
                    return Some((key, true));
                }
                // Unreadable cache entry; fall through to a fresh fetch.
            }
            Ok(None) => {}
            Err(error) => debug!("key cache read failed for {key_id}: {error}"),
        }
        self.get_fresh(key_id).await.map(|key| (key, false))
    }

    /// Resolve `key_id` bypassing the cache, refreshing the cached entry.
    /// Used after a verification failure against a cached key.
    pub async fn get_fresh(&self, key_id: &Url) -> Option<FetchedKey> {
        let cache_key = self.prefix.join(key_id.as_str());
        let fetched = match self.loader.load(key_id).await {
            Ok(doc) => key_from_document(key_id, &doc.document),
            Err(error) => {
                debug!("fetching key {key_id} failed: {error}");
                None
            }
        };
        let (value, ttl) = match &fetched {
            Some(key) => (cache_entry(key), KEY_CACHE_TTL),
            None => (Value::Null, NEGATIVE_CACHE_TTL),
        };
        if let Err(error) = self.kv.set(&cache_key, value, Some(ttl)).await {
            debug!("key cache write failed for {key_id}: {error}");
        }
        fetched
    }
}

fn cache_entry(key: &FetchedKey) -> Value {
    json!({
        "pem": key.key.to_pem().ok(),
        "owner": key.owner.as_ref().map(Url::as_str),
        "alg": key.key.algorithm().rfc9421_name(),
    })
}

fn key_from_cache(key_id: &Url, cached: &Value) -> Option<FetchedKey> {
    let pem = cached.get("pem")?.as_str()?;
    let mut key = PublicKey::import_pem(pem).ok()?;
    if let Some(alg) = cached
        .get("alg")
        .and_then(Value::as_str)
        .and_then(KeyAlgorithm::from_rfc9421_name)
    {
        key = key.with_algorithm(alg).ok()?;
    }
    Some(FetchedKey {
        key_id: key_id.clone(),
        owner: cached
            .get("owner")
            .and_then(Value::as_str)
            .and_then(|s| Url::parse(s).ok()),
        key,
    })
}

/// Extract the key named `key_id` from a fetched JSON-LD document.
///
/// The document is either the key object itself, an actor embedding the key
/// under `publicKey`, or a controller document listing Multikeys under
/// `assertionMethod`.
pub(crate) fn key_from_document(key_id: &Url, document: &Value) -> Option<FetchedKey> {
    let mut candidates: Vec<&Value> = Vec::new();
    for field in ["publicKey", "assertionMethod"] {
        match document.get(field) {
            Some(Value::Array(entries)) => candidates.extend(entries.iter()),
            Some(entry) => candidates.push(entry),
            None => {}
        }
    }
    candidates.push(document);

    let owner_fallback = document.get("id").and_then(str_or_id);
    for candidate in candidates {
        let id_matches = candidate
            .get("id")
            .and_then(Value::as_str)
            .map(|id| id == key_id.as_str());
        // An embedded key must carry the id we asked for; the document
        // itself may omit it.
        if id_matches == Some(false) {
            continue;
        }
        let key = if let Some(pem) = candidate.get("publicKeyPem").and_then(Value::as_str) {
            PublicKey::import_pem(pem).ok()
        } else if let Some(mb) = candidate.get("publicKeyMultibase").and_then(Value::as_str) {
            PublicKey::import_multibase(mb).ok()
        } else {
            None
        };
        let Some(key) = key else { continue };
        let owner = candidate
            .get("owner")
            .or_else(|| candidate.get("controller"))
            .and_then(str_or_id)
            .or_else(|| owner_fallback.clone());
        return Some(FetchedKey {
            key_id: key_id.clone(),
            owner,
            key,
        });
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        document_loader::RemoteDocument,
        keys::generate_rsa_keypair,
        kv::MemoryKvStore,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLoader {
        document: Value,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DocumentLoader for FixedLoader {
        async fn load(&self, url: &Url) -> Result<RemoteDocument, Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.document.is_null() {
                return Err(Error::NotFound);
            }
            Ok(RemoteDocument {
                document_url: url.clone(),
                context_url: None,
                document: self.document.clone(),
            })
        }
    }

    fn actor_with_key(pem: &str) -> Value {
        json!({
            "id": "https://example.com/users/alice",
            "type": "Person",
            "publicKey": {
                "id": "https://example.com/users/alice#main-key",
                "owner": "https://example.com/users/alice",
                "publicKeyPem": pem,
            }
        })
    }

    #[tokio::test]
    async fn test_fetch_and_cache() {
        let pair = generate_rsa_keypair().unwrap();
        let loader = Arc::new(FixedLoader {
            document: actor_with_key(&pair.public_key),
            fetches: AtomicUsize::new(0),
        });
        let ring = KeyRing::new(
            loader.clone(),
            Arc::new(MemoryKvStore::new()),
            KvKey::new(["publicKey"]).unwrap(),
        );
        let key_id = Url::parse("https://example.com/users/alice#main-key").unwrap();

        let (key, cached) = ring.get(&key_id).await.unwrap();
        assert!(!cached);
        assert_eq!(
            key.owner.unwrap().as_str(),
            "https://example.com/users/alice"
        );
        assert_eq!(key.key.to_pem().unwrap(), pair.public_key);

        let (_, cached) = ring.get(&key_id).await.unwrap();
        assert!(cached);
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 1);

        // Bypassing the cache fetches again.
        ring.get_fresh(&key_id).await.unwrap();
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_caching() {
        let loader = Arc::new(FixedLoader {
            document: Value::Null,
            fetches: AtomicUsize::new(0),
        });
        let ring = KeyRing::new(
            loader.clone(),
            Arc::new(MemoryKvStore::new()),
            KvKey::new(["publicKey"]).unwrap(),
        );
        let key_id = Url::parse("https://example.com/users/gone#main-key").unwrap();
        assert!(ring.get(&key_id).await.is_none());
        assert!(ring.get(&key_id).await.is_none());
        // The second miss was answered from the negative cache.
        assert_eq!(loader.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_key_from_document_shapes() {
        let pair = generate_rsa_keypair().unwrap();
        let key_id = Url::parse("https://example.com/users/alice#main-key").unwrap();

        // Embedded under publicKey
        let key = key_from_document(&key_id, &actor_with_key(&pair.public_key)).unwrap();
        assert_eq!(key.key.to_pem().unwrap(), pair.public_key);

        // The key document itself
        let doc = json!({
            "id": key_id.as_str(),
            "owner": "https://example.com/users/alice",
            "publicKeyPem": pair.public_key,
        });
        assert!(key_from_document(&key_id, &doc).is_some());

        // Wrong id is not returned
        let doc = json!({
            "publicKey": {
                "id": "https://example.com/users/alice#other-key",
                "publicKeyPem": pair.public_key,
            }
        });
        assert!(key_from_document(&key_id, &doc).is_none());
    }
}
