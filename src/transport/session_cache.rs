//! # TLS Session Cache
//!
//! In-memory server-side TLS session cache for session resumption, plus the
//! write-once cache of peer certificate chains.
//!
//! ## Features
//! - **Thread-safe**: `Mutex` inside, shareable through `Arc`
//! - **TTL-based expiration**: sessions expire after a configurable duration
//! - **Memory-bounded**: oldest entry evicted when full
//! - **rustls seam**: implements [`StoresServerSessions`] so a server config
//!   can use it directly as `session_storage`
//!
//! ## Usage
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use usc_tunnel::transport::session_cache::SessionCache;
//!
//! let cache = Arc::new(SessionCache::new(256, Duration::from_secs(300)));
//! cache.store(b"id-1".to_vec(), vec![1, 2, 3]);
//! assert_eq!(cache.lookup(b"id-1").as_deref(), Some(&[1u8, 2, 3][..]));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rustls::server::StoresServerSessions;
use tracing::{debug, trace};

/// A cached TLS session with metadata
#[derive(Clone, Debug)]
struct SessionEntry {
    state: Vec<u8>,
    created_at: Instant,
}

impl SessionEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

#[derive(Debug, Default)]
struct SessionCacheInner {
    sessions: HashMap<Vec<u8>, SessionEntry>,
    total_inserts: u64,
    hits: u64,
    misses: u64,
}

/// Thread-safe in-memory TLS server session cache
#[derive(Debug)]
pub struct SessionCache {
    max_entries: usize,
    ttl: Duration,
    inner: Mutex<SessionCacheInner>,
}

impl SessionCache {
    /// Create a cache holding at most `max_entries` sessions for `ttl` each
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            ttl,
            inner: Mutex::new(SessionCacheInner {
                sessions: HashMap::with_capacity(max_entries.min(1024)),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionCacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store session state; evicts expired entries and then the oldest if full
    pub fn store(&self, id: Vec<u8>, state: Vec<u8>) -> bool {
        if self.max_entries == 0 {
            return false;
        }
        let mut inner = self.lock();
        self.evict_expired(&mut inner);

        inner.sessions.insert(
            id,
            SessionEntry {
                state,
                created_at: Instant::now(),
            },
        );
        inner.total_inserts += 1;

        if inner.sessions.len() > self.max_entries {
            Self::evict_oldest(&mut inner);
        }

        trace!(session_count = inner.sessions.len(), "Session stored in cache");
        true
    }

    /// Session state if present and not expired
    pub fn lookup(&self, id: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        match inner.sessions.get(id) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                let state = entry.state.clone();
                inner.hits += 1;
                trace!("Session cache hit");
                Some(state)
            }
            _ => {
                inner.sessions.remove(id);
                inner.misses += 1;
                trace!("Session cache miss or expired");
                None
            }
        }
    }

    /// Remove and return a session (single-use resumption)
    pub fn take_entry(&self, id: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        let entry = inner.sessions.remove(id)?;
        if entry.is_expired(self.ttl) {
            inner.misses += 1;
            return None;
        }
        inner.hits += 1;
        Some(entry.state)
    }

    /// Clear all sessions from the cache
    pub fn clear(&self) {
        let mut inner = self.lock();
        let count = inner.sessions.len();
        inner.sessions.clear();
        debug!(cleared_count = count, "Session cache cleared");
    }

    /// Current cache statistics
    pub fn stats(&self) -> SessionCacheStats {
        let inner = self.lock();
        SessionCacheStats {
            total_entries: inner.sessions.len(),
            max_entries: self.max_entries,
            expired_count: inner
                .sessions
                .values()
                .filter(|e| e.is_expired(self.ttl))
                .count(),
            total_inserts: inner.total_inserts,
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    fn evict_expired(&self, inner: &mut SessionCacheInner) {
        let before = inner.sessions.len();
        let ttl = self.ttl;
        inner.sessions.retain(|_, entry| !entry.is_expired(ttl));
        let after = inner.sessions.len();
        if before != after {
            debug!(
                removed_count = before - after,
                remaining_count = after,
                "Expired sessions evicted"
            );
        }
    }

    fn evict_oldest(inner: &mut SessionCacheInner) {
        if let Some(oldest_key) = inner
            .sessions
            .iter()
            .min_by_key(|(_, entry)| entry.created_at)
            .map(|(k, _)| k.clone())
        {
            inner.sessions.remove(&oldest_key);
            debug!("Oldest session evicted to make room");
        }
    }
}

impl StoresServerSessions for SessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.store(key, value)
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.lookup(key)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.take_entry(key)
    }

    fn can_cache(&self) -> bool {
        self.max_entries > 0
    }
}

/// Statistics about the session cache
#[derive(Debug, Clone, Copy)]
pub struct SessionCacheStats {
    /// Current number of sessions
    pub total_entries: usize,
    /// Maximum capacity
    pub max_entries: usize,
    /// Number of expired but not yet evicted entries
    pub expired_count: usize,
    /// Total sessions ever inserted
    pub total_inserts: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Peer certificate chains keyed by service, each recorded only once
#[derive(Debug, Default)]
pub struct PeerChainCache {
    chains: Mutex<HashMap<String, Arc<str>>>,
}

impl PeerChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `chain` for `service` unless one is already cached.
    ///
    /// Returns true when this call stored the chain.
    pub fn store_once(&self, service: &str, chain: impl FnOnce() -> String) -> bool {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        if chains.contains_key(service) {
            return false;
        }
        chains.insert(service.to_string(), Arc::from(chain()));
        true
    }

    pub fn get(&self, service: &str) -> Option<Arc<str>> {
        self.chains
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_store_and_retrieve() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        cache.store(b"session-1".to_vec(), vec![1, 2, 3, 4]);
        let state = cache.lookup(b"session-1");
        assert!(state.is_some());
        assert_eq!(state.unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_missing_session() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        assert!(cache.lookup(b"nonexistent").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = SessionCache::new(3, Duration::from_secs(60));
        for i in 0..5u8 {
            cache.store(vec![i], vec![i]);
        }
        let stats = cache.stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.total_inserts, 5);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = SessionCache::new(4, Duration::from_millis(1));
        cache.store(b"old".to_vec(), vec![9]);
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.lookup(b"old").is_none());
        assert_eq!(cache.stats().total_entries, 0);
    }

    #[test]
    fn test_take_is_single_use() {
        let cache = SessionCache::new(4, Duration::from_secs(60));
        cache.store(b"t".to_vec(), vec![7]);
        assert_eq!(StoresServerSessions::take(&cache, b"t"), Some(vec![7]));
        assert_eq!(StoresServerSessions::take(&cache, b"t"), None);
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let cache = SessionCache::new(0, Duration::from_secs(60));
        assert!(!cache.can_cache());
        assert!(!cache.put(b"k".to_vec(), vec![1]));
    }

    #[test]
    fn test_clear() {
        let cache = SessionCache::new(10, Duration::from_secs(60));
        cache.store(b"session-1".to_vec(), vec![1, 2, 3]);
        cache.clear();
        assert!(cache.lookup(b"session-1").is_none());
    }

    #[test]
    fn test_peer_chain_write_once() {
        let chains = PeerChainCache::new();
        assert!(chains.store_once("netconf", || "first".to_string()));
        assert!(!chains.store_once("netconf", || "second".to_string()));
        assert_eq!(chains.get("netconf").as_deref(), Some("first"));
        assert!(chains.get("other").is_none());
    }
}
