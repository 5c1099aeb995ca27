//! In-process [`CacheStore`] backed by a sharded concurrent map.
//!
//! Expiry is checked lazily on every access; [`InMemoryStore::spawn_janitor`]
//! additionally sweeps expired entries on an interval so keys that are never
//! read again do not accumulate.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry as MapEntry};
use tokio::{task::JoinHandle, time::Instant};
use tracing::trace;

use super::{
    entry::Expiration,
    error::{StoreError, StoreResult},
    store::{CacheStore, parse_counter},
};

/// Baseline expiration used by [`InMemoryStore::default`].
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct Slot {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// A process-local store.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use pagecache::cache::{CacheStore, Expiration, InMemoryStore, StoreError};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryStore::new(Duration::from_secs(60));
/// store.set("greeting", "hello".into(), Expiration::Default).await.unwrap();
/// assert_eq!(store.get("greeting").await.unwrap().as_ref(), b"hello");
/// assert!(matches!(store.get("other").await, Err(StoreError::CacheMiss)));
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryStore {
    entries: DashMap<String, Slot>,
    default_expiration: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRATION)
    }
}

impl InMemoryStore {
    /// Creates an empty store. A zero `default_expiration` makes
    /// [`Expiration::Default`] entries live forever.
    pub fn new(default_expiration: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_expiration,
        }
    }

    pub fn default_expiration(&self) -> Duration {
        self.default_expiration
    }

    /// Number of entries held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Sweeps expired entries every `every` until the store is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    trace!(purged, "expired cache entries swept");
                }
            }
        })
    }

    fn deadline(&self, expiration: Expiration, now: Instant) -> Option<Instant> {
        match expiration {
            Expiration::Forever => None,
            Expiration::Default if self.default_expiration.is_zero() => None,
            Expiration::Default => Some(now + self.default_expiration),
            Expiration::After(ttl) => Some(now + ttl),
        }
    }

    fn slot(&self, value: Bytes, expiration: Expiration, now: Instant) -> Slot {
        Slot {
            value,
            expires_at: self.deadline(expiration, now),
        }
    }

    // Applies `f` to a live counter, keeping its expiry.
    fn update_counter(&self, key: &str, f: impl FnOnce(u64) -> u64) -> StoreResult<u64> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let current = parse_counter(key, &occupied.get().value)?;
                let next = f(current);
                occupied.get_mut().value = Bytes::from(next.to_string());
                Ok(next)
            }
            MapEntry::Occupied(occupied) => {
                occupied.remove();
                Err(StoreError::CacheMiss)
            }
            MapEntry::Vacant(_) => Err(StoreError::CacheMiss),
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Bytes> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(slot) if slot.is_live(now) => return Ok(slot.value.clone()),
            Some(_) => {}
            None => return Err(StoreError::CacheMiss),
        }
        self.entries.remove_if(key, |_, slot| !slot.is_live(now));
        Err(StoreError::CacheMiss)
    }

    async fn set(&self, key: &str, value: Bytes, expiration: Expiration) -> StoreResult<()> {
        let slot = self.slot(value, expiration, Instant::now());
        self.entries.insert(key.to_owned(), slot);
        Ok(())
    }

    async fn add(&self, key: &str, value: Bytes, expiration: Expiration) -> StoreResult<()> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(occupied) if occupied.get().is_live(now) => {
                Err(StoreError::NotStored)
            }
            MapEntry::Occupied(mut occupied) => {
                occupied.insert(self.slot(value, expiration, now));
                Ok(())
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(self.slot(value, expiration, now));
                Ok(())
            }
        }
    }

    async fn replace(&self, key: &str, value: Bytes, expiration: Expiration) -> StoreResult<()> {
        let now = Instant::now();
        match self.entries.entry(key.to_owned()) {
            MapEntry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                occupied.insert(self.slot(value, expiration, now));
                Ok(())
            }
            MapEntry::Occupied(occupied) => {
                occupied.remove();
                Err(StoreError::NotStored)
            }
            MapEntry::Vacant(_) => Err(StoreError::NotStored),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let now = Instant::now();
        match self.entries.remove(key) {
            Some((_, slot)) if slot.is_live(now) => Ok(()),
            _ => Err(StoreError::CacheMiss),
        }
    }

    async fn increment(&self, key: &str, delta: u64) -> StoreResult<u64> {
        self.update_counter(key, |current| current.wrapping_add(delta))
    }

    async fn decrement(&self, key: &str, delta: u64) -> StoreResult<u64> {
        self.update_counter(key, |current| current.saturating_sub(delta))
    }

    async fn flush(&self) -> StoreResult<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStoreExt;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn typical_get_set() {
        let cache = store();
        cache.set_value("value", &"foo", Expiration::Default).await.unwrap();
        let value: String = cache.get_value("value").await.unwrap();
        assert_eq!(value, "foo");
    }

    #[tokio::test]
    async fn increment_then_decrement() {
        let cache = store();
        cache.set_value("int", &10u64, Expiration::Default).await.unwrap();

        assert_eq!(cache.increment("int", 50).await.unwrap(), 60);
        assert_eq!(cache.get_value::<u64>("int").await.unwrap(), 60);

        assert_eq!(cache.decrement("int", 50).await.unwrap(), 10);
        assert_eq!(cache.get_value::<u64>("int").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn decrement_floors_at_zero() {
        let cache = store();
        cache.set_value("int", &3u64, Expiration::Forever).await.unwrap();
        assert_eq!(cache.decrement("int", 10).await.unwrap(), 0);
        assert_eq!(cache.get_value::<u64>("int").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn increment_rejects_non_numeric() {
        let cache = store();
        cache.set_value("s", &"abc", Expiration::Forever).await.unwrap();
        assert!(matches!(
            cache.increment("s", 1).await,
            Err(StoreError::InvalidPayload { .. })
        ));
    }

    #[tokio::test]
    async fn empty_cache() {
        let cache = store();
        assert!(matches!(cache.get("notexist").await, Err(StoreError::CacheMiss)));
        assert!(matches!(cache.delete("notexist").await, Err(StoreError::CacheMiss)));
        assert!(matches!(cache.increment("notexist", 1).await, Err(StoreError::CacheMiss)));
        assert!(matches!(cache.decrement("notexist", 1).await, Err(StoreError::CacheMiss)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiration() {
        let cache = InMemoryStore::new(Duration::from_secs(1));

        cache.set_value("int", &10u64, Expiration::Default).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(cache.get("int").await, Err(StoreError::CacheMiss)));

        cache.set_value("int", &10u64, Duration::from_secs(1).into()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(cache.get("int").await, Err(StoreError::CacheMiss)));

        cache.set_value("int", &10u64, Duration::from_secs(3600).into()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.get("int").await.is_ok());

        cache.set_value("int", &10u64, Expiration::Forever).await.unwrap();
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert!(cache.get("int").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_default_never_expires() {
        let cache = InMemoryStore::new(Duration::ZERO);
        cache.set("k", Bytes::from_static(b"v"), Expiration::Default).await.unwrap();
        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn replace() {
        let cache = store();
        assert!(matches!(
            cache.replace("notexist", Bytes::from_static(b"1"), Expiration::Forever).await,
            Err(StoreError::NotStored)
        ));

        cache.set_value("int", &1u64, Duration::from_secs(1).into()).await.unwrap();
        cache
            .replace("int", Bytes::from_static(b"2"), Duration::from_secs(1).into())
            .await
            .unwrap();
        assert_eq!(cache.get_value::<u64>("int").await.unwrap(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            cache.replace("int", Bytes::from_static(b"3"), Duration::from_secs(1).into()).await,
            Err(StoreError::NotStored)
        ));
        assert!(matches!(cache.get("int").await, Err(StoreError::CacheMiss)));
    }

    #[tokio::test(start_paused = true)]
    async fn add() {
        let cache = store();
        let ttl: Expiration = Duration::from_secs(1).into();
        cache.add("int", Bytes::from_static(b"1"), ttl).await.unwrap();
        assert!(matches!(
            cache.add("int", Bytes::from_static(b"2"), ttl).await,
            Err(StoreError::NotStored)
        ));

        tokio::time::sleep(Duration::from_secs(2)).await;
        cache.add("int", Bytes::from_static(b"3"), ttl).await.unwrap();
        assert_eq!(cache.get_value::<u64>("int").await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_add_has_one_winner() {
        let cache = Arc::new(store());
        let tasks: Vec<_> = (0..32u64)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .add("lock", Bytes::from(i.to_string()), Expiration::Forever)
                        .await
                        .is_ok()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn flush_clears_everything() {
        let cache = store();
        cache.set("a", Bytes::from_static(b"1"), Expiration::Forever).await.unwrap();
        cache.set("b", Bytes::from_static(b"2"), Expiration::Forever).await.unwrap();
        cache.flush().await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_sweeps_expired_entries() {
        let cache = Arc::new(InMemoryStore::new(Duration::from_secs(1)));
        cache.set("short", Bytes::from_static(b"1"), Expiration::Default).await.unwrap();
        cache.set("long", Bytes::from_static(b"2"), Expiration::Forever).await.unwrap();

        let janitor = cache.spawn_janitor(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 1);

        drop(cache);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(janitor.is_finished());
    }
}
