//! Bounded LRU cache of decomposition results with per-entry TTL
//!
//! Keyed by request fingerprint. Expired entries are never returned and are
//! reclaimed before any live entry is evicted for space.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::request::Fingerprint;
use super::result::DecompositionResult;
use crate::config::CacheConfig;

/// Cache counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Live entries dropped to make room
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
}

#[derive(Debug)]
struct CacheEntry {
    result: DecompositionResult,
    expires_at: Instant,
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Use tick -> key, oldest first
    recency: BTreeMap<u64, Fingerprint>,
    tick: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        self.recency.remove(&entry.last_used);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &expired {
            self.remove(fp);
        }
        self.stats.expirations += expired.len() as u64;
        expired.len()
    }

    fn evict_lru(&mut self) -> Option<Fingerprint> {
        let (_, fingerprint) = self.recency.pop_first()?;
        self.entries.remove(&fingerprint);
        self.stats.evictions += 1;
        Some(fingerprint)
    }
}

/// Thread-safe decomposition cache
#[derive(Debug)]
pub struct DecompositionCache {
    capacity: usize,
    default_ttl: Duration,
    inner: Mutex<CacheInner>,
}

impl DecompositionCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity,
            default_ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity.min(4096)),
                ..CacheInner::default()
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.ttl())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a live entry and mark it most recently used
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<DecompositionResult> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(fingerprint) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(fingerprint);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            debug!(fingerprint = %fingerprint.short(), "Cache entry expired");
            return None;
        }

        let tick = inner.next_tick();
        let inner = &mut *inner;
        let entry = inner.entries.get_mut(fingerprint)?;
        inner.recency.remove(&entry.last_used);
        entry.last_used = tick;
        inner.recency.insert(tick, fingerprint.clone());
        inner.stats.hits += 1;
        Some(entry.result.clone())
    }

    /// Store a result for `ttl`, replacing any existing entry
    ///
    /// A zero TTL or zero capacity stores nothing.
    pub fn put(&self, fingerprint: Fingerprint, result: DecompositionResult, ttl: Duration) {
        if ttl.is_zero() || self.capacity == 0 {
            return;
        }

        let now = Instant::now();
        let mut inner = self.lock();
        inner.remove(&fingerprint);

        if inner.entries.len() >= self.capacity {
            inner.purge_expired(now);
        }
        while inner.entries.len() >= self.capacity {
            match inner.evict_lru() {
                Some(evicted) => debug!(fingerprint = %evicted.short(), "Evicted LRU cache entry"),
                None => break,
            }
        }

        let tick = inner.next_tick();
        inner.recency.insert(tick, fingerprint.clone());
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                result,
                expires_at: now + ttl,
                last_used: tick,
            },
        );
    }

    /// Drop an entry; returns whether one was present
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().remove(fingerprint).is_some()
    }

    /// Number of stored entries, including expired ones not yet reclaimed
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    /// Reclaim every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.lock().purge_expired(Instant::now())
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }
}
