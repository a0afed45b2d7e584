use jsonpath_lib::Compiled;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of compiled patterns kept per dialect.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Stats for both pattern caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PatternCacheStats {
    pub regex: CacheStats,
    pub jsonpath: CacheStats,
}

/// Size-bounded LRU keyed by pattern text.
struct BoundedCache<V> {
    entries: Mutex<LruCache<String, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V> BoundedCache<V> {
    fn new(capacity: NonZeroUsize) -> Self {
        BoundedCache {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value, or compile and insert it.
    ///
    /// Compilation runs outside the lock; a concurrent miss on the same key
    /// compiles twice and the second insert wins.
    fn get_or_compile<E>(
        &self,
        key: &str,
        compile: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        if let Some(hit) = self.entries.lock().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(compile()?);
        self.entries.lock().put(key.to_string(), compiled.clone());
        Ok(compiled)
    }

    fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: entries.len(),
            capacity: entries.cap().get(),
        }
    }

    fn clear(&self) {
        self.entries.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Compiled-pattern cache shared by every matcher.
///
/// One process-wide instance backs [`super::PatternEngine::shared`]; tests
/// build their own to stay isolated.
pub struct PatternCache {
    regex: BoundedCache<Regex>,
    jsonpath: BoundedCache<Compiled>,
}

impl PatternCache {
    /// Create a cache holding at most `capacity` entries per dialect.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        PatternCache {
            regex: BoundedCache::new(capacity),
            jsonpath: BoundedCache::new(capacity),
        }
    }

    pub(crate) fn regex<E>(
        &self,
        pattern: &str,
        compile: impl FnOnce() -> Result<Regex, E>,
    ) -> Result<Arc<Regex>, E> {
        self.regex.get_or_compile(pattern, compile)
    }

    pub(crate) fn jsonpath<E>(
        &self,
        query: &str,
        compile: impl FnOnce() -> Result<Compiled, E>,
    ) -> Result<Arc<Compiled>, E> {
        self.jsonpath.get_or_compile(query, compile)
    }

    pub fn stats(&self) -> PatternCacheStats {
        PatternCacheStats {
            regex: self.regex.stats(),
            jsonpath: self.jsonpath.stats(),
        }
    }

    /// Drop every compiled pattern and reset counters.
    pub fn clear(&self) {
        self.regex.clear();
        self.jsonpath.clear();
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        PatternCache::new(DEFAULT_CACHE_CAPACITY)
    }
}
