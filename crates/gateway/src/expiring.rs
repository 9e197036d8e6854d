use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Process-local set of keys with a fixed expiry each.
///
/// Expired entries read as absent immediately. Physical removal walks an
/// insertion-ordered queue from the front, so sweep-on-growth and eviction
/// cost amortized O(1) per insert. With one TTL per store the queue front is
/// always the entry closest to expiry. Cloning shares the underlying map.
#[derive(Clone)]
pub struct ExpiringKeyStore<K> {
    inner: Arc<Mutex<Entries<K>>>,
    high_water: usize,
}

struct Entries<K> {
    expiry: HashMap<K, Instant>,
    // Insertion order. A queued pair whose instant no longer matches `expiry`
    // is stale and skipped when it reaches the front.
    order: VecDeque<(Instant, K)>,
}

impl<K> Entries<K>
where
    K: Eq + Hash + Clone,
{
    fn insert(&mut self, key: K, expires_at: Instant) {
        self.expiry.insert(key.clone(), expires_at);
        self.order.push_back((expires_at, key));
    }

    fn is_current(&self, expires_at: Instant, key: &K) -> bool {
        self.expiry.get(key) == Some(&expires_at)
    }

    /// Pops expired or stale pairs off the front; stops at the first live one.
    fn drain_expired_front(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((expires_at, key)) = self.order.front() {
            if !self.is_current(*expires_at, key) {
                self.order.pop_front();
                continue;
            }
            if *expires_at > now {
                break;
            }
            if let Some((_, key)) = self.order.pop_front() {
                self.expiry.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Drops the oldest live entry.
    fn evict_front(&mut self) -> bool {
        while let Some((expires_at, key)) = self.order.pop_front() {
            if self.is_current(expires_at, &key) {
                self.expiry.remove(&key);
                return true;
            }
        }
        false
    }

    /// Rebuilds the queue once stale pairs outnumber live ones.
    fn compact_order(&mut self) {
        if self.order.len() <= self.expiry.len().saturating_mul(2) {
            return;
        }
        let expiry = &self.expiry;
        self.order
            .retain(|(expires_at, key)| expiry.get(key) == Some(expires_at));
    }
}

impl<K> ExpiringKeyStore<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(high_water: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Entries {
                expiry: HashMap::new(),
                order: VecDeque::new(),
            })),
            high_water: high_water.max(1),
        }
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Inserts or overwrites `key`, expiring `ttl` from now.
    pub fn put(&self, key: K, ttl: Duration) {
        self.put_at(key, ttl, Instant::now());
    }

    /// True while `key` is present and unexpired.
    pub fn get(&self, key: &K) -> bool {
        self.get_at(key, Instant::now())
    }

    /// Marks `key` unless a live entry already exists. Returns true when the
    /// mark was placed. Check and insert happen under one lock acquisition.
    pub fn insert_if_absent(&self, key: K, ttl: Duration) -> bool {
        self.insert_if_absent_at(key, ttl, Instant::now())
    }

    pub fn remove(&self, key: &K) -> bool {
        self.lock().expiry.remove(key).is_some()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Physical size, including expired entries not swept yet.
    pub fn len(&self) -> usize {
        self.lock().expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn put_at(&self, key: K, ttl: Duration, now: Instant) {
        let mut entries = self.lock();
        entries.insert(key, now + ttl);
        self.enforce_high_water(&mut entries, now);
    }

    pub(crate) fn get_at(&self, key: &K, now: Instant) -> bool {
        self.lock()
            .expiry
            .get(key)
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub(crate) fn insert_if_absent_at(&self, key: K, ttl: Duration, now: Instant) -> bool {
        let mut entries = self.lock();
        if entries
            .expiry
            .get(&key)
            .is_some_and(|expires_at| *expires_at > now)
        {
            return false;
        }

        entries.insert(key, now + ttl);
        self.enforce_high_water(&mut entries, now);
        true
    }

    /// Full pass over the map; entries with a shorter TTL than those queued
    /// ahead of them are caught here rather than by the front walk.
    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.expiry.len();
        entries.expiry.retain(|_, expires_at| *expires_at > now);
        entries.compact_order();
        before - entries.expiry.len()
    }

    fn enforce_high_water(&self, entries: &mut Entries<K>, now: Instant) {
        if entries.order.len() <= self.high_water {
            return;
        }

        let removed = entries.drain_expired_front(now);
        if removed > 0 {
            tracing::debug!(
                removed,
                remaining = entries.expiry.len(),
                high_water = self.high_water,
                "expiring_store.sweep"
            );
        }

        let mut evicted = 0usize;
        while entries.expiry.len() > self.high_water && entries.evict_front() {
            evicted += 1;
        }
        if evicted > 0 {
            tracing::warn!(
                evicted,
                high_water = self.high_water,
                "expiring_store.evicted_live_entries"
            );
        }

        entries.compact_order();
    }

    fn lock(&self) -> MutexGuard<'_, Entries<K>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
