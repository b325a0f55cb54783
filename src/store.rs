//! Upper-layer store contract
//!
//! An in-memory cache that spills entries to disk talks to the block cache
//! through [`CacheStore`]. [`TypedStore`] layers serde encoding on top so
//! callers can spill structured values instead of raw bytes.

use std::marker::PhantomData;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{BlockCache, CacheKey};
use crate::error::Result;

/// Byte-level spill store
pub trait CacheStore<K> {
    /// Persist `value` under `key`, optionally expiring after `tti` idle
    fn store(&self, key: K, value: &[u8], tti: Option<Duration>) -> Result<()>;

    /// Read the value under `key`
    fn retrieve(&self, key: &K) -> Result<Option<Bytes>>;

    /// Remove and return the value under `key`
    fn delete(&self, key: &K) -> Result<Option<Bytes>>;

    /// Release the store
    fn close(&self) -> Result<()>;
}

impl<K: CacheKey> CacheStore<K> for BlockCache<K> {
    fn store(&self, key: K, value: &[u8], tti: Option<Duration>) -> Result<()> {
        match tti {
            Some(tti) => self.put_with_idle(key, value, tti),
            None => self.put(key, value),
        }
    }

    fn retrieve(&self, key: &K) -> Result<Option<Bytes>> {
        self.get(key)
    }

    fn delete(&self, key: &K) -> Result<Option<Bytes>> {
        BlockCache::delete(self, key)
    }

    fn close(&self) -> Result<()> {
        BlockCache::close(self)
    }
}

/// Serde-encoded values over any [`CacheStore`]
pub struct TypedStore<K, V, S> {
    inner: S,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V, S> TypedStore<K, V, S>
where
    S: CacheStore<K>,
    V: Serialize + DeserializeOwned,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn put(&self, key: K, value: &V, tti: Option<Duration>) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.inner.store(key, &encoded, tti)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        decode(self.inner.retrieve(key)?)
    }

    /// Remove and decode; used when promoting an entry back into memory
    pub fn take(&self, key: &K) -> Result<Option<V>> {
        decode(self.inner.delete(key)?)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn decode<V: DeserializeOwned>(raw: Option<Bytes>) -> Result<Option<V>> {
    raw.map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, MIN_CAPACITY_PER_BLOCK};
    use crate::error::Error;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        visits: u32,
    }

    fn make_cache(dir: &std::path::Path) -> BlockCache<String> {
        let config = CacheConfig::new()
            .with_capacity_per_block(MIN_CAPACITY_PER_BLOCK)
            .unwrap()
            .with_initial_block_count(1)
            .unwrap();
        BlockCache::open(dir.join("store"), config).unwrap()
    }

    #[test]
    fn test_cache_store_contract() {
        let root = tempdir().unwrap();
        let cache = make_cache(root.path());
        let store: &dyn CacheStore<String> = &cache;

        store.store("k".to_string(), b"bytes", None).unwrap();
        assert_eq!(
            store.retrieve(&"k".to_string()).unwrap().as_deref(),
            Some(&b"bytes"[..])
        );
        assert_eq!(
            store.delete(&"k".to_string()).unwrap().as_deref(),
            Some(&b"bytes"[..])
        );
        assert!(store.retrieve(&"k".to_string()).unwrap().is_none());
        store.close().unwrap();
        assert!(matches!(store.close(), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn test_typed_store() {
        let root = tempdir().unwrap();
        let typed: TypedStore<String, Session, _> = TypedStore::new(make_cache(root.path()));
        let session = Session {
            user: "ada".into(),
            visits: 3,
        };

        typed
            .put("s1".into(), &session, Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(typed.get(&"s1".into()).unwrap(), Some(session.clone()));
        assert_eq!(typed.take(&"s1".into()).unwrap(), Some(session));
        assert!(typed.get(&"s1".into()).unwrap().is_none());
        assert!(!typed.inner().contains("s1").unwrap());
    }

    #[test]
    fn test_typed_store_rejects_garbage() {
        let root = tempdir().unwrap();
        let cache = make_cache(root.path());
        cache.put("bad".into(), b"\xff not json").unwrap();
        let typed: TypedStore<String, Session, _> = TypedStore::new(cache);
        assert!(matches!(typed.get(&"bad".into()), Err(Error::Json(_))));
    }
}
