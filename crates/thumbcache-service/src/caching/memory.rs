use std::sync::Mutex;

use lru::LruCache;

use super::CacheKey;

/// Byte-budgeted in-memory cache of decoded assets.
///
/// Entries are ordered strictly least-recently-used over both reads and
/// writes. Eviction runs synchronously inside [`put`](Self::put): whenever
/// the aggregate weight of the stored assets exceeds the configured budget,
/// the oldest entries are dropped until the cache is back under budget. The
/// aggregate weight thus never exceeds the budget after a `put` returns.
///
/// Eviction only reclaims memory; it does not write anything through to the
/// persistent layer.
pub struct MemoryCache<A> {
    state: Mutex<State<A>>,
    weigher: Box<dyn Fn(&A) -> u64 + Send + Sync>,
    budget: u64,
}

struct State<A> {
    entries: LruCache<CacheKey, Entry<A>>,
    total_bytes: u64,
}

struct Entry<A> {
    asset: A,
    weight: u64,
}

impl<A: Clone> MemoryCache<A> {
    /// Creates a cache bounded by `budget` bytes.
    ///
    /// The `weigher` computes an asset's decoded byte footprint; it is
    /// evaluated once per insertion.
    pub fn new(budget: u64, weigher: impl Fn(&A) -> u64 + Send + Sync + 'static) -> Self {
        MemoryCache {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            weigher: Box::new(weigher),
            budget,
        }
    }

    /// Looks up an asset, marking it as most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<A> {
        let mut state = self.state.lock().unwrap();
        state.entries.get(key).map(|entry| entry.asset.clone())
    }

    /// Stores an asset, evicting the least recently used entries while the
    /// budget is exceeded.
    pub fn put(&self, key: CacheKey, asset: A) {
        let weight = (self.weigher)(&asset);
        let mut state = self.state.lock().unwrap();

        if let Some(old) = state.entries.put(key, Entry { asset, weight }) {
            state.total_bytes -= old.weight;
        }
        state.total_bytes += weight;

        while state.total_bytes > self.budget {
            match state.entries.pop_lru() {
                Some((_, evicted)) => state.total_bytes -= evicted.weight,
                None => break,
            }
        }
    }

    /// Aggregate weight of all stored assets, in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().unwrap().total_bytes
    }

    /// Whether an asset is stored, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().unwrap().entries.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(url: &str) -> CacheKey {
        CacheKey::from_url(url).unwrap()
    }

    fn byte_cache(budget: u64) -> MemoryCache<Vec<u8>> {
        MemoryCache::new(budget, |asset: &Vec<u8>| asset.len() as u64)
    }

    #[test]
    fn test_budget_never_exceeded() {
        let cache = byte_cache(100);

        cache.put(key("a"), vec![0; 60]);
        cache.put(key("b"), vec![0; 60]);

        assert!(cache.total_bytes() <= 100);
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.get(&key("b")), Some(vec![0; 60]));
    }

    #[test]
    fn test_reads_refresh_recency() {
        let cache = byte_cache(150);

        cache.put(key("a"), vec![1; 50]);
        cache.put(key("b"), vec![2; 50]);
        // touching `a` makes `b` the eviction candidate
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), vec![3; 60]);

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.total_bytes(), 110);
    }

    #[test]
    fn test_replacing_updates_accounting() {
        let cache = byte_cache(100);

        cache.put(key("a"), vec![0; 50]);
        cache.put(key("a"), vec![0; 30]);

        assert_eq!(cache.total_bytes(), 30);
    }

    #[test]
    fn test_oversized_asset() {
        let cache = byte_cache(10);

        cache.put(key("a"), vec![0; 20]);

        assert_eq!(cache.total_bytes(), 0);
        assert!(!cache.contains(&key("a")));
    }
}
