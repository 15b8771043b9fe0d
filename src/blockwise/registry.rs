//! Registry of active transfers, keyed by [`TransferKey`].
//!
//! Map operations are atomic under the registry lock; statuses themselves
//! are guarded by their own mutex, and observer notifications always fire
//! with the registry lock released. Capacity is bounded: a flood of new
//! transfers cancels the one nearest its cleanup deadline (every mutation
//! rearms a transfer's deadline, so that is the least recently touched)
//! instead of growing without limit.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use lru_time_cache::LruCache;

use super::key::TransferKey;
use super::status::{Block1Status, Block2Status, TransferEnd};

/// Locks a mutex, recovering the data from a poisoned lock rather than
/// propagating the panic of an unrelated worker.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Minimal view the cache needs of a status.
pub(crate) trait TrackedStatus: Send {
    fn deadline(&self) -> Instant;
    fn expired(&self, now: Instant) -> bool;
    fn finish(&mut self, end: &TransferEnd);
}

impl TrackedStatus for Block1Status {
    fn deadline(&self) -> Instant {
        Block1Status::deadline(self)
    }
    fn expired(&self, now: Instant) -> bool {
        Block1Status::expired(self, now)
    }
    fn finish(&mut self, end: &TransferEnd) {
        Block1Status::finish(self, end)
    }
}

impl TrackedStatus for Block2Status {
    fn deadline(&self) -> Instant {
        Block2Status::deadline(self)
    }
    fn expired(&self, now: Instant) -> bool {
        Block2Status::expired(self, now)
    }
    fn finish(&mut self, end: &TransferEnd) {
        Block2Status::finish(self, end)
    }
}

/// One direction's worth of transfer state.
pub(crate) struct StatusCache<K: Ord + Clone, S: TrackedStatus> {
    entries: Mutex<LruCache<K, Arc<Mutex<S>>>>,
    capacity: usize,
}

impl<K: Ord + Clone, S: TrackedStatus> StatusCache<K, S> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::with_capacity(capacity)),
            capacity,
        }
    }

    /// Inserting a new key into a full cache must not let the map drop an
    /// entry behind our back: the displaced transfer's observers have to
    /// hear about it. The entry nearest its cleanup deadline is the least
    /// recently touched one, so that is the one to give up.
    fn evict_for(
        entries: &mut LruCache<K, Arc<Mutex<S>>>,
        capacity: usize,
        key: &K,
    ) -> Option<Arc<Mutex<S>>> {
        if entries.len() < capacity || entries.get(key).is_some() {
            return None;
        }
        let stalest = entries
            .iter()
            .min_by_key(|(_, status)| lock(status).deadline())
            .map(|(stale, _)| stale.clone())?;
        entries.remove(&stalest)
    }

    pub fn get(&self, key: &K) -> Option<Arc<Mutex<S>>> {
        lock(&self.entries).get(key).cloned()
    }

    /// Inserts a status. A displaced same-key status, or the stalest one
    /// when the cache is full, is cancelled with the registry lock
    /// released.
    pub fn insert(&self, key: K, status: Arc<Mutex<S>>) {
        let (displaced, evicted) = {
            let mut entries = lock(&self.entries);
            let evicted = Self::evict_for(&mut entries, self.capacity, &key);
            (entries.insert(key, status), evicted)
        };
        if let Some(old) = evicted {
            lock(&old).finish(&TransferEnd::Cancelled);
        }
        if let Some(old) = displaced {
            lock(&old).finish(&TransferEnd::Cancelled);
        }
    }

    pub fn remove(&self, key: &K) -> Option<Arc<Mutex<S>>> {
        lock(&self.entries).remove(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Removes every status whose cleanup deadline has passed, notifying
    /// its observers of the timeout.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(K, Arc<Mutex<S>>)> = {
            let mut entries = lock(&self.entries);
            entries
                .iter()
                .filter(|(_, status)| lock(status).expired(now))
                .map(|(key, status)| (key.clone(), Arc::clone(status)))
                .collect()
        };

        let mut purged = 0;
        for (key, status) in expired {
            if lock(&self.entries).remove(&key).is_some() {
                purged += 1;
                lock(&status).finish(&TransferEnd::TimedOut);
            }
        }
        purged
    }
}

/// The per-layer registry: at most one active Block1 and one active Block2
/// transfer per key (RFC 7959 §2.4).
pub(crate) struct TransferRegistry<Endpoint: Ord + Clone> {
    pub block1: StatusCache<TransferKey<Endpoint>, Block1Status>,
    pub block2: StatusCache<TransferKey<Endpoint>, Block2Status>,
}

impl<Endpoint: Ord + Clone> TransferRegistry<Endpoint> {
    pub fn new(capacity: usize) -> Self {
        Self {
            block1: StatusCache::with_capacity(capacity),
            block2: StatusCache::with_capacity(capacity),
        }
    }

    pub fn purge_expired(&self) -> usize {
        self.block1.purge_expired() + self.block2.purge_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn status(lifetime: Duration) -> Arc<Mutex<Block1Status>> {
        Arc::new(Mutex::new(Block1Status::new_inbound(
            6, None, 1024, lifetime,
        )))
    }

    fn observed(
        lifetime: Duration,
        expect: TransferEnd,
        counter: &Arc<AtomicUsize>,
    ) -> Arc<Mutex<Block1Status>> {
        let status = status(lifetime);
        let counter = Arc::clone(counter);
        lock(&status).add_observer(Box::new(move |end| {
            assert_eq!(&expect, end);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        status
    }

    const LIFETIME: Duration = Duration::from_secs(30);

    #[test]
    fn insert_get_remove() {
        let cache: StatusCache<u32, Block1Status> =
            StatusCache::with_capacity(4);
        cache.insert(1, status(LIFETIME));
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
        assert!(cache.remove(&1).is_some());
        assert!(cache.remove(&1).is_none());
        assert_eq!(0, cache.len());
    }

    #[test]
    fn same_key_insert_cancels_previous() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cache: StatusCache<u32, Block1Status> =
            StatusCache::with_capacity(4);

        cache.insert(1, observed(LIFETIME, TransferEnd::Cancelled, &cancelled));
        cache.insert(1, status(LIFETIME));

        assert_eq!(1, cancelled.load(Ordering::SeqCst));
        assert_eq!(1, cache.len());
    }

    #[test]
    fn capacity_eviction_cancels_stalest() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let cache: StatusCache<u32, Block1Status> =
            StatusCache::with_capacity(2);

        cache.insert(1, observed(LIFETIME, TransferEnd::Cancelled, &cancelled));
        cache.insert(2, status(LIFETIME));
        cache.insert(3, status(LIFETIME));

        assert_eq!(1, cancelled.load(Ordering::SeqCst));
        assert!(cache.get(&1).is_none());
        assert!(cache.get(&2).is_some());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn purge_notifies_timed_out() {
        let timed_out = Arc::new(AtomicUsize::new(0));
        let cache: StatusCache<u32, Block1Status> =
            StatusCache::with_capacity(4);

        cache.insert(
            1,
            observed(Duration::ZERO, TransferEnd::TimedOut, &timed_out),
        );
        cache.insert(2, status(LIFETIME));

        assert_eq!(1, cache.purge_expired());
        assert_eq!(1, timed_out.load(Ordering::SeqCst));
        assert_eq!(1, cache.len());
        assert_eq!(0, cache.purge_expired());
    }
}
