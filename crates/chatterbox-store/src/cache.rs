//! In-process caches using [`moka`].
//!
//! [`CacheLayer`] is a thin, typed wrapper around `moka::sync::Cache` that
//! tracks hit/miss statistics. [`Caches`] is the registry of every cache the
//! stores use; it lives inside the [`Database`](crate::Database) handle so all
//! stores built from clones of one database share the same entries.
//!
//! Entries never expire by time. Every mutating store path updates or
//! invalidates its cache while it still holds the connection lock, so a
//! concurrent reader can never re-insert a value that a writer has just
//! removed.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use moka::sync::Cache;
use tracing::debug;

use crate::channel::BanWordMatcher;
use crate::config::StoreConfig;
use crate::platform::Platform;
use crate::role::RoleKind;

// ── cache stats ──────────────────────────────────────────────────────

/// Counters tracking cache effectiveness.
#[derive(Debug)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Total cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total lookups (hits + misses).
    pub fn total(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hit rate as a value between 0.0 and 1.0 (returns 0.0 if no lookups).
    pub fn hit_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.hits() as f64 / total as f64
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} total={} rate={:.2}%",
            self.hits(),
            self.misses(),
            self.total(),
            self.hit_rate() * 100.0,
        )
    }
}

// ── cache layer ──────────────────────────────────────────────────────

/// A named, typed cache with hit/miss accounting.
pub struct CacheLayer<K, V> {
    name: &'static str,
    inner: Cache<K, V>,
    stats: Arc<CacheStats>,
}

impl<K, V> Clone for CacheLayer<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<K, V> CacheLayer<K, V>
where
    K: Hash + Eq + Send + Sync + fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `max_capacity` entries.
    pub fn new(name: &'static str, max_capacity: u64) -> Self {
        debug!(name, max_capacity, "cache layer created");
        Self {
            name,
            inner: Cache::builder().max_capacity(max_capacity).build(),
            stats: Arc::new(CacheStats::new()),
        }
    }

    /// Look up a cached value. Returns `None` on miss.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.inner.get(key) {
            Some(value) => {
                self.stats.record_hit();
                debug!(cache = self.name, ?key, "cache hit");
                Some(value)
            }
            None => {
                self.stats.record_miss();
                debug!(cache = self.name, ?key, "cache miss");
                None
            }
        }
    }

    /// Insert or replace a value.
    pub fn insert(&self, key: K, value: V) {
        debug!(cache = self.name, ?key, "cache insert");
        self.inner.insert(key, value);
    }

    /// Remove a specific entry.
    pub fn invalidate(&self, key: &K) {
        self.inner.invalidate(key);
        debug!(cache = self.name, ?key, "cache invalidate");
    }

    /// Remove all entries.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
        debug!(cache = self.name, "cache invalidate_all");
    }

    /// Get a reference to the cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Approximate number of entries; flushes moka's pending housekeeping first.
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    /// The name this cache logs under.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ── registry ─────────────────────────────────────────────────────────

/// Key of the username → user id cache.
pub type UsernameKey = (Platform, String);
/// Key of the positive role cache.
pub type RoleKey = (RoleKind, Platform, i64);
/// Key of the profile existence cache and the per-channel caches.
pub type IdKey = (Platform, i64);

/// Every cache shared by the stores of one database.
#[derive(Clone)]
pub struct Caches {
    /// Username → user id. Populated on lookup and on mapping.
    pub usernames: CacheLayer<UsernameKey, i64>,
    /// (role kind, platform, user id) → role record id. Positive results only.
    pub roles: CacheLayer<RoleKey, i64>,
    /// Profiles known to exist. Positive results only; profiles are never deleted.
    pub profiles: CacheLayer<IdKey, ()>,
    /// Channel → explicitly configured command prefix.
    pub prefixes: CacheLayer<IdKey, String>,
    /// Channel → compiled ban word matcher. Dropped whenever the list changes.
    pub ban_words: CacheLayer<IdKey, Arc<BanWordMatcher>>,
}

impl Caches {
    /// Build the registry with capacities taken from `config`.
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            usernames: CacheLayer::new("usernames", config.username_cache_capacity),
            roles: CacheLayer::new("roles", config.role_cache_capacity),
            profiles: CacheLayer::new("profiles", config.profile_cache_capacity),
            prefixes: CacheLayer::new("prefixes", config.prefix_cache_capacity),
            ban_words: CacheLayer::new("ban_words", config.ban_word_cache_capacity),
        }
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.usernames.invalidate_all();
        self.roles.invalidate_all();
        self.profiles.invalidate_all();
        self.prefixes.invalidate_all();
        self.ban_words.invalidate_all();
    }
}

// ── tests ────────────────────────────────────────────────────────────
