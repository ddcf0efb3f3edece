//! Keyed Mutex
//!
//! Mutual exclusion scoped to a key. Threads holding different keys never
//! block each other; threads holding equal keys are serialized. Slots are
//! created on first use and pruned when the last holder or waiter leaves,
//! so the table only grows with the number of keys in flight.

use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::RawMutex;
use parking_lot::lock_api::ArcMutexGuard;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

type Slot = Arc<Mutex<()>>;

/// A table of mutexes addressed by key
pub struct KeyedMutex<K>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, Slot>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Blocks until the section for `key` is free, then enters it
    ///
    /// The section is held until the returned guard is dropped. Guards are
    /// `'static` and may be moved into a transaction to span its lifetime.
    pub fn lock(&self, key: K) -> KeyGuard<K> {
        let slot = self.slot(&key);
        let guard = slot.lock_arc();
        KeyGuard {
            slots: Arc::clone(&self.slots),
            key: Some(key),
            guard: Some(guard),
        }
    }

    /// Enters the section for `key` only if nobody holds it
    pub fn try_lock(&self, key: K) -> Option<KeyGuard<K>> {
        let slot = self.slot(&key);
        match slot.try_lock_arc() {
            Some(guard) => Some(KeyGuard {
                slots: Arc::clone(&self.slots),
                key: Some(key),
                guard: Some(guard),
            }),
            None => {
                drop(slot);
                prune(&self.slots, &key);
                None
            }
        }
    }

    /// Runs `f` inside the section for `key`
    pub fn with_key<T>(&self, key: K, f: impl FnOnce() -> T) -> T {
        let _guard = self.lock(key);
        f()
    }

    /// Number of keys currently held or waited on
    pub fn in_flight(&self) -> usize {
        self.slots.len()
    }

    // The shard lock is released before the caller blocks on the slot.
    fn slot(&self, key: &K) -> Slot {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}

impl<K> Default for KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for KeyedMutex<K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedMutex")
            .field("in_flight", &self.slots.len())
            .finish()
    }
}

/// Proof of holding the section for one key
///
/// Dropping the guard releases the section, including during unwinding.
pub struct KeyGuard<K>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, Slot>>,
    key: Option<K>,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl<K> KeyGuard<K>
where
    K: Eq + Hash,
{
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }
}

impl<K> Drop for KeyGuard<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(key) = self.key.take() {
            prune(&self.slots, &key);
        }
    }
}

impl<K> fmt::Debug for KeyGuard<K>
where
    K: Eq + Hash + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

// A slot referenced only by the table has no holder and no waiter.
fn prune<K: Eq + Hash>(slots: &DashMap<K, Slot>, key: &K) {
    slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_equal_keys_are_serialized() {
        let sections = Arc::new(KeyedMutex::<String>::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sections = Arc::clone(&sections);
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        sections.with_key("build-1".to_string(), || {
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(sections.in_flight(), 0);
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let sections = Arc::new(KeyedMutex::<String>::new());
        let _held = sections.lock("build-1".to_string());

        let (done_tx, done_rx) = mpsc::channel();
        let other = Arc::clone(&sections);
        thread::spawn(move || {
            other.with_key("deploy".to_string(), || ());
            done_tx.send(()).unwrap();
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let sections = KeyedMutex::<i64>::new();
        let held = sections.lock(7);
        assert!(sections.try_lock(7).is_none());
        assert!(sections.try_lock(8).is_some());
        drop(held);
        assert!(sections.try_lock(7).is_some());
    }

    #[test]
    fn test_section_released_on_panic() {
        let sections = KeyedMutex::<String>::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sections.with_key("build-1".to_string(), || panic!("loader exploded"));
        }));
        assert!(result.is_err());
        assert!(sections.try_lock("build-1".to_string()).is_some());
        assert_eq!(sections.in_flight(), 0);
    }

    #[test]
    fn test_guard_can_move_across_threads() {
        let sections = Arc::new(KeyedMutex::<String>::new());
        let guard = sections.lock("build-1".to_string());
        assert_eq!(guard.key().map(String::as_str), Some("build-1"));

        thread::spawn(move || drop(guard)).join().unwrap();

        assert!(sections.try_lock("build-1".to_string()).is_some());
    }
}
