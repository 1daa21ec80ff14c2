//! Single-flight cache with optional time-to-live.
//!
//! Concurrent misses for the same key collapse into one fetch: the first
//! caller runs it, every other caller waits on the same slot. Failed fetches
//! and fetches whose caller was dropped leave no value behind, so the next
//! caller starts a fresh fetch.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

struct Slot<V> {
    cell: OnceCell<(V, Instant)>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self { cell: OnceCell::new() }
    }

    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match (self.cell.get(), ttl) {
            (Some((_, loaded_at)), Some(ttl)) => now.duration_since(*loaded_at) >= ttl,
            _ => false,
        }
    }
}

/// Cache whose population runs at most once per key at a time.
pub struct SingleFlightCache<K, V> {
    ttl: Option<Duration>,
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache whose entries never expire.
    #[must_use]
    pub fn new() -> Self {
        Self { ttl: None, slots: Mutex::new(HashMap::new()) }
    }

    /// Creates a cache whose entries expire `ttl` after they were loaded.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), slots: Mutex::new(HashMap::new()) }
    }

    /// Returns the configured time-to-live.
    #[must_use]
    pub const fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Returns the cached value for `key` if it is loaded and fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock();
        let slot = slots.get(key)?;
        if slot.is_expired(self.ttl, Instant::now()) {
            return None;
        }
        slot.cell.get().map(|(value, _)| value.clone())
    }

    /// Stores a value directly, replacing any existing entry.
    pub fn insert(&self, key: K, value: V) {
        let slot = Slot::new();
        // A fresh cell cannot already be initialized
        let _ = slot.cell.set((value, Instant::now()));
        self.slots.lock().insert(key, Arc::new(slot));
    }

    /// Returns the cached value for `key`, running `fetch` on a miss.
    ///
    /// Concurrent callers missing on the same key share a single `fetch`.
    ///
    /// # Errors
    ///
    /// Returns the error of the fetch this caller ran or waited on. Nothing
    /// is cached for a failed fetch.
    pub async fn get_or_try_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot_for(&key);

        let result = slot
            .cell
            .get_or_try_init(|| async { fetch().await.map(|value| (value, Instant::now())) })
            .await
            .map(|(value, _)| value.clone());

        if result.is_err() {
            self.remove_if_empty(&key, &slot);
        }
        result
    }

    /// Drops the entry for `key`.
    pub fn invalidate(&self, key: &K) {
        self.slots.lock().remove(key);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Number of loaded, unexpired entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.cell.initialized() && !slot.is_expired(self.ttl, now))
            .count()
    }

    /// Whether no loaded, unexpired entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_for(&self, key: &K) -> Arc<Slot<V>> {
        let mut slots = self.slots.lock();
        let now = Instant::now();
        match slots.get(key) {
            Some(slot) if !slot.is_expired(self.ttl, now) => Arc::clone(slot),
            _ => {
                let slot = Arc::new(Slot::new());
                slots.insert(key.clone(), Arc::clone(&slot));
                slot
            }
        }
    }

    fn remove_if_empty(&self, key: &K, slot: &Arc<Slot<V>>) {
        let mut slots = self.slots.lock();
        if let Some(current) = slots.get(key) {
            if Arc::ptr_eq(current, slot) && !current.cell.initialized() {
                slots.remove(key);
            }
        }
    }
}

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
