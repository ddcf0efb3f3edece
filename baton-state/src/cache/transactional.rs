//! Transactional Cache
//!
//! A concurrent map whose entries are only ever removed after the write
//! that made them stale has committed. Reads never see a value a rolled
//! back transaction produced, and a load that started before a commit can
//! never leave its pre-commit result behind: loading and invalidating the
//! same key both happen inside that key's section.
//!
//! Values are cloned on the way in and on the way out, so callers may
//! mutate what they get without affecting other readers.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sync::KeyedMutex;
use crate::transaction::Transaction;

struct Entry<V> {
    value: Arc<V>,
    dependency: Option<String>,
}

/// Counters describing cache effectiveness
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    invalidations: AtomicU64,
}

pub struct TransactionalCache<K, V>
where
    K: Eq + Hash,
{
    name: &'static str,
    entries: DashMap<K, Entry<V>>,
    dependents: DashMap<String, HashSet<K>>,
    sections: KeyedMutex<K>,
    capacity: usize,
    counters: Counters,
}

impl<K, V> TransactionalCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            dependents: DashMap::new(),
            sections: KeyedMutex::new(),
            capacity,
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns a private copy of the cached value
    pub fn get(&self, key: &K) -> Option<V> {
        match self.peek(key) {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Stores a value loaded from committed state
    pub fn put(&self, key: K, value: V) {
        let _section = self.sections.lock(key.clone());
        self.store(key, value, None);
    }

    /// Stores a value and files it under `dependency` for group invalidation
    pub fn put_with_dependency(&self, key: K, dependency: &str, value: V) {
        let _section = self.sections.lock(key.clone());
        self.link(dependency, &key);
        self.store(key, value, Some(dependency));
    }

    /// Returns the cached value, or runs `loader` to produce and cache it
    ///
    /// Concurrent callers for the same missing key run the loader once; the
    /// rest wait and then read the cached result. A failed load caches
    /// nothing and the error goes to the caller that ran it.
    pub fn read_through<E>(&self, key: K, loader: impl FnOnce() -> Result<V, E>) -> Result<V, E> {
        self.load(key, None, loader)
    }

    /// Like [`read_through`](Self::read_through), filing the entry under `dependency`
    pub fn read_through_with_dependency<E>(
        &self,
        key: K,
        dependency: &str,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        self.load(key, Some(dependency), loader)
    }

    /// Schedules removal of `key` for after `tx` commits
    ///
    /// Nothing happens if the transaction rolls back.
    pub fn invalidate_after_commit(self: &Arc<Self>, tx: &Transaction, key: K) {
        let cache = Arc::clone(self);
        tx.on_after_commit(move || cache.invalidate(&key));
    }

    /// Schedules removal of every entry filed under `dependency` for after `tx` commits
    pub fn invalidate_dependency_after_commit(self: &Arc<Self>, tx: &Transaction, dependency: String) {
        let cache = Arc::clone(self);
        tx.on_after_commit(move || cache.invalidate_dependency(&dependency));
    }

    /// Removes `key` now, waiting for any in-flight load of it to finish
    pub fn invalidate(&self, key: &K) {
        let _section = self.sections.lock(key.clone());
        if let Some((_, entry)) = self.entries.remove(key) {
            if let Some(dependency) = entry.dependency {
                self.unlink(&dependency, key);
            }
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(cache = self.name, "Invalidated entry");
        }
    }

    /// Removes every entry filed under `dependency` now
    pub fn invalidate_dependency(&self, dependency: &str) {
        let Some((_, keys)) = self.dependents.remove(dependency) else {
            return;
        };
        for key in keys {
            let _section = self.sections.lock(key.clone());
            if self.entries.remove(&key).is_some() {
                self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            }
        }
        tracing::trace!(cache = self.name, dependency, "Invalidated dependency group");
    }

    /// Drops every entry
    pub fn clear(&self) {
        self.entries.clear();
        self.dependents.clear();
        tracing::debug!(cache = self.name, "Cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    fn load<E>(
        &self,
        key: K,
        dependency: Option<&str>,
        loader: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let _section = self.sections.lock(key.clone());
        if let Some(value) = self.peek(&key) {
            return Ok(value);
        }

        // Filed before loading so a group invalidation racing the load waits for it.
        if let Some(dependency) = dependency {
            self.link(dependency, &key);
        }

        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        match loader() {
            Ok(value) => {
                self.store(key, value.clone(), dependency);
                Ok(value)
            }
            Err(err) => {
                if let Some(dependency) = dependency {
                    self.unlink(dependency, &key);
                }
                Err(err)
            }
        }
    }

    fn peek(&self, key: &K) -> Option<V> {
        let value = self.entries.get(key).map(|entry| Arc::clone(&entry.value))?;
        Some(V::clone(&value))
    }

    // Caller holds the section for `key`.
    fn store(&self, key: K, value: V, dependency: Option<&str>) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            tracing::debug!(cache = self.name, capacity = self.capacity, "Cache full, not storing");
            if let Some(dependency) = dependency {
                self.unlink(dependency, &key);
            }
            return;
        }
        self.entries.insert(
            key,
            Entry {
                value: Arc::new(value),
                dependency: dependency.map(str::to_string),
            },
        );
    }

    fn link(&self, dependency: &str, key: &K) {
        self.dependents
            .entry(dependency.to_string())
            .or_default()
            .insert(key.clone());
    }

    fn unlink(&self, dependency: &str, key: &K) {
        self.dependents.remove_if_mut(dependency, |_, keys| {
            keys.remove(key);
            keys.is_empty()
        });
    }
}

impl<K, V> std::fmt::Debug for TransactionalCache<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalCache")
            .field("name", &self.name)
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use crate::transaction::Transactions;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn transactions() -> Transactions {
        Transactions::new(Arc::new(InMemoryStore::new()))
    }

    #[test]
    fn test_read_through_loads_once_then_hits() {
        let cache = TransactionalCache::<String, u32>::new("test", 16);
        let loads = AtomicUsize::new(0);
        let loader = || -> Result<u32, ()> {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        };

        assert_eq!(cache.read_through("a".to_string(), loader), Ok(7));
        assert_eq!(cache.read_through("a".to_string(), loader), Ok(7));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_concurrent_misses_run_loader_once() {
        let cache = Arc::new(TransactionalCache::<String, Vec<i64>>::new("test", 16));
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(10));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loads = Arc::clone(&loads);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.read_through("history".to_string(), || -> Result<_, ()> {
                        loads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(vec![3, 2, 1])
                    })
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Ok(vec![3, 2, 1]));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_caches_nothing() {
        let cache = TransactionalCache::<String, u32>::new("test", 16);

        let result = cache.read_through("a".to_string(), || Err("backend down"));
        assert_eq!(result, Err("backend down"));
        assert!(cache.get(&"a".to_string()).is_none());

        let result = cache.read_through("a".to_string(), || Ok::<_, &str>(3));
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_copy_on_read() {
        let cache = TransactionalCache::<String, Vec<i64>>::new("test", 16);
        cache.put("a".to_string(), vec![1, 2]);

        let mut copy = cache.get(&"a".to_string()).unwrap();
        copy.push(3);

        assert_eq!(cache.get(&"a".to_string()), Some(vec![1, 2]));
    }

    #[test]
    fn test_invalidation_waits_for_commit() {
        let cache = Arc::new(TransactionalCache::<String, u32>::new("test", 16));
        cache.put("a".to_string(), 1);

        let result: Result<(), crate::error::StoreError> = transactions().run(|tx| {
            cache.invalidate_after_commit(tx, "a".to_string());
            assert_eq!(cache.get(&"a".to_string()), Some(1));
            Ok(())
        });

        assert!(result.is_ok());
        assert!(cache.get(&"a".to_string()).is_none());
    }

    #[test]
    fn test_rollback_keeps_entry() {
        let cache = Arc::new(TransactionalCache::<String, u32>::new("test", 16));
        cache.put("a".to_string(), 1);

        let result: Result<(), crate::error::StoreError> = transactions().run(|tx| {
            cache.invalidate_after_commit(tx, "a".to_string());
            Err(crate::error::StoreError::Conflict("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_invalidation_waits_for_in_flight_load() {
        let cache = Arc::new(TransactionalCache::<String, u32>::new("test", 16));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let loader_cache = Arc::clone(&cache);
        let loader = thread::spawn(move || {
            loader_cache.read_through("a".to_string(), || -> Result<u32, ()> {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(1)
            })
        });
        started_rx.recv().unwrap();

        let invalidator_cache = Arc::clone(&cache);
        let invalidator = thread::spawn(move || invalidator_cache.invalidate(&"a".to_string()));

        thread::sleep(Duration::from_millis(50));
        release_tx.send(()).unwrap();

        assert_eq!(loader.join().unwrap(), Ok(1));
        invalidator.join().unwrap();
        assert!(cache.get(&"a".to_string()).is_none());
    }

    #[test]
    fn test_dependency_group_invalidation() {
        let cache = TransactionalCache::<(String, usize), u32>::new("test", 16);
        cache.put_with_dependency(("build".to_string(), 0), "build/compile", 1);
        cache.put_with_dependency(("build".to_string(), 10), "build/compile", 2);
        cache.put_with_dependency(("build".to_string(), 20), "build/test", 3);

        cache.invalidate_dependency("build/compile");

        assert!(!cache.contains(&("build".to_string(), 0)));
        assert!(!cache.contains(&("build".to_string(), 10)));
        assert!(cache.contains(&("build".to_string(), 20)));
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[test]
    fn test_full_cache_serves_without_storing() {
        let cache = TransactionalCache::<u32, u32>::new("test", 1);
        assert_eq!(cache.read_through(1, || Ok::<_, ()>(10)), Ok(10));
        assert_eq!(cache.read_through(2, || Ok::<_, ()>(20)), Ok(20));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
    }
}
