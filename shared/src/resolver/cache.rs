//! Two-tier coordinate cache.
//!
//! The global tier lives in the key-value store and survives restarts; it is
//! authoritative, consulted first and always written. The session tier is an
//! in-memory LRU that only lives as long as the process.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::capabilities::{load_json_or_default, store_json, KeyNamespace, KeyValueStore, KvError, KvKey};
use crate::model::{Locale, UnixTimeMs, ValidatedCoordinate};

pub const CACHE_KEY_VERSION: u32 = 1;

/// Wall-clock source, injectable so TTL expiry can be tested.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateCacheEntry {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: UnixTimeMs,
}

impl CoordinateCacheEntry {
    pub fn new(coordinate: ValidatedCoordinate, timestamp: UnixTimeMs) -> Self {
        Self {
            lat: coordinate.lat(),
            lon: coordinate.lon(),
            timestamp,
        }
    }

    pub fn is_fresh(&self, now: UnixTimeMs, ttl_ms: u64) -> bool {
        now.elapsed_since(self.timestamp) < ttl_ms
    }

    /// Stored entries are re-validated; a tampered entry reads as a miss.
    pub fn coordinate(&self) -> Option<ValidatedCoordinate> {
        ValidatedCoordinate::new(self.lat, self.lon).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    Global,
    Session,
}

/// Normalized `(name, country, description prefix)` and the hashed store key
/// derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoordinateCacheKey {
    normalized: String,
    kv_key: KvKey,
}

impl CoordinateCacheKey {
    pub fn for_locale(locale: &Locale, description_chars: usize) -> Result<Self, KvError> {
        let description: String =
            normalize_component(locale.description.as_deref().unwrap_or_default())
                .chars()
                .take(description_chars)
                .collect();
        let normalized = format!(
            "{}|{}|{}",
            normalize_component(&locale.name),
            normalize_component(locale.country().unwrap_or_default()),
            description.trim_end(),
        );
        let hash = blake3::hash(normalized.as_bytes());
        let kv_key = KvKey::new(
            KeyNamespace::Cache,
            format!("coord_v{}_{}", CACHE_KEY_VERSION, &hash.to_hex()[..16]),
        )?;
        Ok(Self { normalized, kv_key })
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn kv_key(&self) -> &KvKey {
        &self.kv_key
    }
}

fn normalize_component(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct CoordinateCache {
    store: Arc<dyn KeyValueStore>,
    session: Mutex<LruCache<String, CoordinateCacheEntry>>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl CoordinateCache {
    pub fn new(store: Arc<dyn KeyValueStore>, session_capacity: usize, ttl_ms: u64) -> Self {
        Self::with_clock(store, session_capacity, ttl_ms, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn KeyValueStore>,
        session_capacity: usize,
        ttl_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(session_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            session: Mutex::new(LruCache::new(capacity)),
            clock,
            ttl_ms,
        }
    }

    /// Global tier first, then session. A hit in one tier backfills the other.
    pub async fn lookup(&self, key: &CoordinateCacheKey) -> Option<(ValidatedCoordinate, CacheTier)> {
        let now = self.clock.now();

        if let Some(entry) = self.load_global(key).await {
            if entry.is_fresh(now, self.ttl_ms) {
                if let Some(coordinate) = entry.coordinate() {
                    debug!(key = key.normalized(), "global coordinate cache hit");
                    self.session.lock().await.put(key.normalized.clone(), entry);
                    return Some((coordinate, CacheTier::Global));
                }
            }
        }

        let session_hit = {
            let mut session = self.session.lock().await;
            match session.get(&key.normalized).copied() {
                Some(entry) if entry.is_fresh(now, self.ttl_ms) => Some(entry),
                Some(_) => {
                    session.pop(&key.normalized);
                    None
                }
                None => None,
            }
        };

        let Some(entry) = session_hit else {
            debug!(key = key.normalized(), "coordinate cache miss");
            return None;
        };
        let coordinate = entry.coordinate()?;
        debug!(key = key.normalized(), "session coordinate cache hit, promoting");
        self.write_global(key, &entry).await;
        Some((coordinate, CacheTier::Session))
    }

    /// Writes both tiers with the current timestamp.
    pub async fn insert(&self, key: &CoordinateCacheKey, coordinate: ValidatedCoordinate) {
        let entry = CoordinateCacheEntry::new(coordinate, self.clock.now());
        self.session.lock().await.put(key.normalized.clone(), entry);
        self.write_global(key, &entry).await;
    }

    pub async fn session_len(&self) -> usize {
        self.session.lock().await.len()
    }

    async fn load_global(&self, key: &CoordinateCacheKey) -> Option<CoordinateCacheEntry> {
        match load_json_or_default::<Option<CoordinateCacheEntry>, _>(self.store.as_ref(), &key.kv_key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key = %key.kv_key.raw(), error = %e, "global coordinate cache unreadable");
                None
            }
        }
    }

    async fn write_global(&self, key: &CoordinateCacheKey, entry: &CoordinateCacheEntry) {
        if let Err(e) = store_json(self.store.as_ref(), &key.kv_key, entry).await {
            error!(key = %key.kv_key.raw(), error = %e, "failed to persist coordinate cache entry");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::InMemoryKvStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Manually advanced clock.
    #[derive(Debug, Default)]
    pub(crate) struct ManualClock(AtomicU64);

    impl ManualClock {
        pub(crate) fn at(ms: u64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(ms)))
        }

        pub(crate) fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> UnixTimeMs {
            UnixTimeMs(self.0.load(Ordering::SeqCst))
        }
    }

    const TTL: u64 = 24 * 60 * 60 * 1000;

    fn locale() -> Locale {
        Locale::new("l1", "Hampi", UnixTimeMs(0))
            .with_country("IN")
            .with_description("Ruins of the Vijayanagara empire on the Tungabhadra")
    }

    fn coord() -> ValidatedCoordinate {
        ValidatedCoordinate::new(15.335, 76.46).unwrap()
    }

    #[test]
    fn key_normalizes_case_and_whitespace() {
        let a = CoordinateCacheKey::for_locale(&locale(), 32).unwrap();
        let b = CoordinateCacheKey::for_locale(
            &Locale::new("other-id", "  HAMPI ", UnixTimeMs(9))
                .with_country("in")
                .with_description("Ruins of the  Vijayanagara empire on the Tungabhadra"),
            32,
        )
        .unwrap();
        assert_eq!(a.kv_key(), b.kv_key());
        assert!(a.kv_key().key().starts_with("coord_v1_"));
        assert_eq!(a.kv_key().key().len(), "coord_v1_".len() + 16);
    }

    #[test]
    fn description_whitespace_collapses_before_prefix_cut() {
        let spaced = Locale::new("l2", "Hampi", UnixTimeMs(0))
            .with_country("IN")
            .with_description("Ruins    of    the    Vijayanagara empire");
        let a = CoordinateCacheKey::for_locale(&locale(), 20).unwrap();
        let b = CoordinateCacheKey::for_locale(&spaced, 20).unwrap();
        assert_eq!(a.normalized(), "hampi|in|ruins of the vijayan");
        assert_eq!(a, b);
    }

    #[test]
    fn key_uses_only_description_prefix() {
        let base = locale();
        let mut longer = locale();
        longer.description = Some(format!("{} and more text", base.description.clone().unwrap()));
        let a = CoordinateCacheKey::for_locale(&base, 20).unwrap();
        let b = CoordinateCacheKey::for_locale(&longer, 20).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn insert_writes_both_tiers() {
        let store = Arc::new(InMemoryKvStore::new());
        let cache = CoordinateCache::with_clock(store.clone(), 8, TTL, ManualClock::at(1_000));
        let key = CoordinateCacheKey::for_locale(&locale(), 32).unwrap();

        cache.insert(&key, coord()).await;
        assert_eq!(store.len(), 1);
        assert_eq!(cache.session_len().await, 1);
        assert_eq!(cache.lookup(&key).await, Some((coord(), CacheTier::Global)));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let store = Arc::new(InMemoryKvStore::new());
        let clock = ManualClock::at(1_000);
        let cache = CoordinateCache::with_clock(store, 8, TTL, clock.clone());
        let key = CoordinateCacheKey::for_locale(&locale(), 32).unwrap();

        cache.insert(&key, coord()).await;
        clock.advance(TTL - 1);
        assert!(cache.lookup(&key).await.is_some());
        clock.advance(1);
        assert!(cache.lookup(&key).await.is_none());
    }

    #[tokio::test]
    async fn session_hit_is_promoted_to_global() {
        let store = Arc::new(InMemoryKvStore::new());
        let cache = CoordinateCache::with_clock(store.clone(), 8, TTL, ManualClock::at(1_000));
        let key = CoordinateCacheKey::for_locale(&locale(), 32).unwrap();

        cache.insert(&key, coord()).await;
        store.delete(key.kv_key()).await.unwrap();

        assert_eq!(cache.lookup(&key).await, Some((coord(), CacheTier::Session)));
        assert!(store.get(key.kv_key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupt_global_entry_reads_as_miss() {
        let store = Arc::new(InMemoryKvStore::new());
        let cache = CoordinateCache::with_clock(store.clone(), 8, TTL, ManualClock::at(1_000));
        let key = CoordinateCacheKey::for_locale(&locale(), 32).unwrap();

        store.insert_raw(key.kv_key(), "{not json").unwrap();
        assert!(cache.lookup(&key).await.is_none());

        store
            .insert_raw(key.kv_key(), r#"{"lat":0.0,"lon":0.0,"timestamp":1000}"#)
            .unwrap();
        assert!(cache.lookup(&key).await.is_none());
    }
}
