//! Grant cache used as a bounded-age fallback when the authoritative source
//! is slow or unavailable

use blake3::Hasher;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{Privilege, PrivilegeSet, Resource, Subject};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct GrantCacheConfig {
    /// Maximum number of entries in the cache
    pub capacity: usize,

    /// Entries older than this are never served
    pub ttl: Duration,
}

impl Default for GrantCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Cache key type (BLAKE3 hash)
type CacheKey = [u8; 32];

/// Privileges granted by a fresh authoritative check
#[derive(Debug, Clone)]
pub struct CachedGrant {
    pub subject: String,
    pub resource: String,
    pub privileges: PrivilegeSet,
    pub cached_at: Instant,
}

impl CachedGrant {
    pub fn age(&self) -> Duration {
        self.cached_at.elapsed()
    }
}

/// In-memory TTL cache of fresh grants
pub struct GrantCache {
    entries: DashMap<CacheKey, CachedGrant>,
    config: GrantCacheConfig,
    hits: AtomicUsize,
    misses: AtomicUsize,
    expirations: AtomicUsize,
}

impl GrantCache {
    pub fn new(config: GrantCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            expirations: AtomicUsize::new(0),
        }
    }

    pub fn put(
        &self,
        subject: &Subject,
        resource: &Resource,
        operation: Privilege,
        privileges: PrivilegeSet,
    ) {
        if self.entries.len() >= self.config.capacity {
            self.evict_oldest();
        }

        self.entries.insert(
            Self::compute_key(&subject.id, &resource.id, operation),
            CachedGrant {
                subject: subject.id.clone(),
                resource: resource.id.clone(),
                privileges,
                cached_at: Instant::now(),
            },
        );
    }

    /// Cached grant, only if it is no older than `max_age` (and the TTL)
    pub fn get_fresh(
        &self,
        subject: &Subject,
        resource: &Resource,
        operation: Privilege,
        max_age: Duration,
    ) -> Option<CachedGrant> {
        let key = Self::compute_key(&subject.id, &resource.id, operation);
        let Some(entry) = self.entries.get(&key).map(|e| e.clone()) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let age = entry.age();
        if age > self.config.ttl {
            self.entries.remove(&key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if age > max_age {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Remove every grant held by `subject`; returns the count removed
    pub fn invalidate_subject(&self, subject: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, grant| grant.subject != subject);
        let removed = before.saturating_sub(self.entries.len());
        debug!(subject, removed, "Invalidated cached grants for subject");
        removed
    }

    /// Remove every grant on `resource`; returns the count removed
    pub fn invalidate_resource(&self, resource: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, grant| grant.resource != resource);
        let removed = before.saturating_sub(self.entries.len());
        debug!(resource, removed, "Invalidated cached grants for resource");
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.entries.len(),
            max_entries: self.config.capacity,
        }
    }

    fn compute_key(subject: &str, resource: &str, operation: Privilege) -> CacheKey {
        let mut hasher = Hasher::new();

        // Length prefixes keep ("a:b", "c") and ("a", "b:c") apart
        for part in [subject, resource, operation.as_str()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }

        *hasher.finalize().as_bytes()
    }

    /// Evict the oldest tenth of the entries
    fn evict_oldest(&self) {
        let to_remove = (self.config.capacity / 10).max(1);

        let mut by_age: Vec<(CacheKey, Instant)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);

        for (key, _) in by_age.into_iter().take(to_remove) {
            self.entries.remove(&key);
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub expirations: usize,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
