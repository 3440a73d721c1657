//! Per-key cancelable delayed actions.
//!
//! Used for stop timeouts and restart backoff. Each armed entry records a
//! generation and its deadline; arming a key that is already armed cancels
//! the old action first.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Deadline used for delays too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Entry {
    generation: u64,
    deadline: Instant,
    handle: AbortHandle,
}

struct Inner<K> {
    next_generation: u64,
    entries: HashMap<K, Entry>,
}

/// Registry of at most one pending delayed action per key.
pub struct TimerRegistry<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> Clone for TimerRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> Default for TimerRegistry<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_generation: 1,
                entries: HashMap::new(),
            })),
        }
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means another thread panicked mid map update; the
    // map itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm `key` to run `action` after `delay`, replacing any pending action.
    /// Returns the generation of the new entry.
    pub fn arm<F>(&self, key: K, delay: Duration, action: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if let Some(old) = inner.entries.remove(&key) {
            old.handle.abort();
        }
        self.insert(&mut inner, key, delay, action)
    }

    /// Arm `key` only if nothing is pending for it.
    pub fn arm_if_absent<F>(&self, key: K, delay: Duration, action: F) -> Option<u64>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.entries.contains_key(&key) {
            return None;
        }
        Some(self.insert(&mut inner, key, delay, action))
    }

    fn insert<F>(&self, inner: &mut Inner<K>, key: K, delay: Duration, action: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);

        // The entry is inserted before the lock is released, so the task
        // always finds it (or its replacement) when it wakes.
        let registry = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if registry.take_if_current(&task_key, generation) {
                action.await;
            }
        })
        .abort_handle();

        inner.entries.insert(
            key,
            Entry {
                generation,
                deadline,
                handle,
            },
        );
        generation
    }

    /// Remove the entry for `key` if it is still the one armed as
    /// `generation`. The pending entry is always gone before its action runs.
    fn take_if_current(&self, key: &K, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.generation == generation => {
                inner.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Cancel the pending action for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.lock().entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending action.
    pub fn cancel_all(&self) {
        for (_, entry) in self.lock().entries.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.lock().entries.get(key).map(|e| e.deadline)
    }

    #[cfg(test)]
    pub fn generation(&self, key: &K) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.generation)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
