//! TTL cache backend for session liveness.
//!
//! The cache is the authoritative store for session liveness while it is
//! enabled; the durable store is only consulted when the cache backend is
//! disabled entirely. All callers go through [`TimedCache`], which bounds
//! every operation with a short timeout so a degraded backend can never
//! stall the request path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Errors from the cache backend. Callers on the authentication path treat
/// any of these as "not found / not renewed" (fail closed).
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache operation timed out")]
    Timeout,
}

/// A string-keyed TTL cache.
///
/// Implementations must expire entries no later than their TTL and must be
/// safe for concurrent use. The trait is object-safe so test doubles and
/// alternative backends can be injected.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Get a value. Expired or missing keys return `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Set a value with a TTL, replacing any existing entry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remaining TTL of a key, or `None` if the key is absent or expired.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// List live keys with the given prefix.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process TTL cache. Entries are evicted lazily on read and during
/// prefix scans.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired: drop it under the write lock.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(Entry::is_expired) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.is_expired());
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Wraps a cache backend and bounds every call with a timeout.
///
/// A slow backend surfaces as [`CacheError::Timeout`], which the session
/// layer maps onto its fail-closed branch.
#[derive(Clone)]
pub struct TimedCache {
    inner: Arc<dyn Cache>,
    timeout: Duration,
}

impl TimedCache {
    pub fn new(inner: Arc<dyn Cache>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout)?
    }
}

#[async_trait]
impl Cache for TimedCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.timed(self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.timed(self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.timed(self.inner.delete(key)).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.timed(self.inner.ttl(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.timed(self.inner.expire(key, ttl)).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        self.timed(self.inner.keys(prefix)).await
    }
}
