//! Per-key async mutual exclusion
//!
//! One `tokio::sync::Mutex` per key currently in use, created on first lock
//! and dropped again once no task holds or waits for it.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

pub struct KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    locks: DashMap<K, Arc<Mutex<()>>>,
    enabled: bool,
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn default() -> Self {
        Self::new(true)
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    /// With `enabled == false` every lock is granted immediately
    pub fn new(enabled: bool) -> Self {
        Self {
            locks: DashMap::new(),
            enabled,
        }
    }

    /// Wait until no other task holds `key`
    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        if !self.enabled {
            return KeyGuard {
                locks: &self.locks,
                key,
                guard: None,
            };
        }

        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        if mutex.try_lock().is_err() {
            trace!(?key, "Waiting for in-flight computation");
        }
        let guard = mutex.lock_owned().await;

        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on
    pub fn in_flight_count(&self) -> usize {
        self.locks.len()
    }
}

/// Held lock on one key, released on drop
pub struct KeyGuard<'a, K>
where
    K: Eq + Hash + Clone,
{
    locks: &'a DashMap<K, Arc<Mutex<()>>>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyGuard<'_, K>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            // Only the map's own reference left: nobody is waiting
            self.locks
                .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialised() {
        let locks = Arc::new(KeyedLocks::<(i64, i64)>::default());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock((1, 1)).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::<i64>::default();
        let _first = locks.lock(1).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(second.is_ok());
        assert_eq!(locks.in_flight_count(), 2);
    }

    #[tokio::test]
    async fn test_disabled_locks_never_wait() {
        let locks = KeyedLocks::<i64>::new(false);
        let _first = locks.lock(1).await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.lock(1)).await;
        assert!(second.is_ok());
        assert_eq!(locks.in_flight_count(), 0);
    }
}
