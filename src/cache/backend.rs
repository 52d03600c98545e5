//! Cache backend implementations.

use super::key::Fingerprint;
use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
struct CacheEntry {
    data: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

/// Storage behind a [`ResponseCache`](super::ResponseCache).
///
/// Implementations must never return an entry whose age has reached its TTL.
/// A backend shared across processes would implement this trait.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &Fingerprint, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &Fingerprint) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    /// Number of live (unexpired) entries.
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// In-process LRU cache with lazy TTL expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &Fingerprint) -> Result<Option<Vec<u8>>> {
        let mut entries = self.lock();
        let now = Instant::now();
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.data.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &Fingerprint, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.lock();
        entries.put(key.clone(), CacheEntry::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn delete(&self, key: &Fingerprint) -> Result<bool> {
        Ok(self.lock().pop(key).is_some())
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let now = Instant::now();
        Ok(self
            .lock()
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Backend used when caching is disabled; every lookup misses.
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &Fingerprint) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn set(&self, _: &Fingerprint, _: &[u8], _: Duration) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _: &Fingerprint) -> Result<bool> {
        Ok(false)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
