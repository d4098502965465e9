//! Time-after-write caches owned by an endpoint
//!
//! Expired values are still served to concurrent readers while one caller
//! refreshes them.

use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

struct Slot<T> {
    written: Instant,
    value: T,
}

pub struct SingleValueCache<T> {
    ttl: Duration,
    slot: Mutex<Option<Slot<T>>>,
    refreshing: AtomicBool,
}

/// Resets the refreshing flag even if the loading future is dropped
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<T: Clone> SingleValueCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
            refreshing: AtomicBool::new(false),
        }
    }

    fn read(&self) -> Option<(bool, T)> {
        let slot = self.slot.lock().ok()?;
        slot.as_ref()
            .map(|s| (s.written.elapsed() < self.ttl, s.value.clone()))
    }

    /// Last stored value regardless of its age
    pub fn peek(&self) -> Option<T> {
        self.read().map(|(_, v)| v)
    }

    pub fn put(&self, value: T) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = Some(Slot {
                written: Instant::now(),
                value,
            });
        }
    }

    pub fn invalidate(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    /// Fresh value, or the stale one while another caller refreshes, or a
    /// newly loaded value.
    pub async fn get_or_load<F, Fut, E>(&self, load: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let stale = match self.read() {
            Some((true, value)) => return Ok(value),
            Some((false, value)) => Some(value),
            None => None,
        };
        let acquired = self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !acquired {
            if let Some(value) = stale {
                return Ok(value);
            }
        }
        let _guard = acquired.then(|| RefreshGuard(&self.refreshing));
        let value = load().await?;
        self.put(value.clone());
        Ok(value)
    }
}

/// Per-key variant used for container details
pub struct KeyedCache<K, V> {
    ttl: Duration,
    entries: DashMap<K, Slot<V>>,
}

impl<K: Eq + Hash, V: Clone> KeyedCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    fn is_fresh(&self, slot: &Slot<V>) -> bool {
        slot.written.elapsed() < self.ttl
    }

    /// Fresh value of `key`. An expired entry is dropped on the way.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            // the shard read lock must be released before remove_if
            let entry = self.entries.get(key)?;
            if self.is_fresh(&entry) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, slot| !self.is_fresh(slot));
        None
    }

    /// Store a value and sweep every expired entry
    pub fn put(&self, key: K, value: V) {
        self.entries.retain(|_, slot| self.is_fresh(slot));
        self.entries.insert(
            key,
            Slot {
                written: Instant::now(),
                value,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_fresh_value_is_not_reloaded() {
        let cache = SingleValueCache::new(Duration::from_secs(60));
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let v: Result<u32, ()> = cache
                .get_or_load(|| async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await;
            assert_eq!(v, Ok(7));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_value_is_reloaded() {
        let cache = SingleValueCache::new(Duration::ZERO);
        cache.put(1u32);
        let v: Result<u32, ()> = cache.get_or_load(|| async { Ok(2) }).await;
        assert_eq!(v, Ok(2));
        assert_eq!(cache.peek(), Some(2));
    }

    #[tokio::test]
    async fn test_stale_value_served_while_refreshing() {
        let cache = SingleValueCache::new(Duration::ZERO);
        cache.put(1u32);
        cache.refreshing.store(true, Ordering::SeqCst);
        let v: Result<u32, ()> = cache.get_or_load(|| async { Err(()) }).await;
        assert_eq!(v, Ok(1));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_value() {
        let cache = SingleValueCache::new(Duration::ZERO);
        cache.put(1u32);
        let v: Result<u32, &str> = cache.get_or_load(|| async { Err("offline") }).await;
        assert_eq!(v, Err("offline"));
        assert_eq!(cache.peek(), Some(1));
        assert!(!cache.refreshing.load(Ordering::SeqCst));
    }

    #[test]
    fn test_keyed_cache_invalidate() {
        let cache = KeyedCache::new(Duration::from_secs(60));
        cache.put("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
    }

    #[test]
    fn test_keyed_cache_drops_expired_entries() {
        let cache = KeyedCache::new(Duration::ZERO);
        cache.put("a".to_string(), 1);
        cache.put("b".to_string(), 2);
        // "a" was swept when "b" went in
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"b".to_string()), None);
        assert!(cache.is_empty());
    }
}
