//! Deduplicating, rate-limited work queue.
//!
//! Keys wait in a ready list and are marked in-flight while a worker
//! holds them. The invariant that makes the reconciler safe without
//! per-key locking: at most one in-flight delivery per key. A key
//! re-added while being processed is delivered exactly once more,
//! after the current pass calls `done`.

use crate::backoff::MaxOfRateLimiter;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Identity of a Network pending reconciliation.
///
/// Carries no payload: current state is always re-read when the key is
/// processed (level-triggered, not edge-triggered).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace of the Network
    pub namespace: String,
    /// Name of the Network
    pub name: String,
}

impl ObjectKey {
    /// Build a key from a namespace and name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

struct Inner<K> {
    /// Keys ready for delivery, in insertion order
    ready: VecDeque<K>,
    /// Keys pending delivery (ready or awaiting redelivery after done)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    shutting_down: bool,
}

/// Work queue with the dedup and in-flight-marking contract.
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Insert a key unless it is already pending.
    ///
    /// A key currently in-flight is only marked dirty; `done` moves it
    /// back to the ready list, so the second notification collapses
    /// into exactly one redelivery.
    pub fn add(&self, key: K) {
        {
            let mut inner = self.lock();
            if inner.shutting_down || inner.dirty.contains(&key) {
                return;
            }
            inner.dirty.insert(key.clone());
            if inner.processing.contains(&key) {
                return;
            }
            inner.ready.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Block until a key is available, marking it in-flight.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(key) = inner.ready.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    if !inner.ready.is_empty() {
                        // Cascade the wakeup to the next idle worker
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    // Wake the next blocked getter so shutdown fans out
                    self.notify.notify_one();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Clear the in-flight mark; redeliver if the key was re-added
    /// while being processed.
    pub fn done(&self, key: &K) {
        let redeliver = {
            let mut inner = self.lock();
            inner.processing.remove(key);
            if inner.dirty.contains(key) {
                inner.ready.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if redeliver {
            self.notify.notify_one();
        }
    }

    /// Refuse new keys and make `get` return `None` once drained.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of keys ready for delivery.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Whether no keys are ready for delivery.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().ready.is_empty()
    }

    /// Whether `shut_down` has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Work queue with rate-limited requeues.
///
/// `add_rate_limited` re-inserts a key after the delay computed by the
/// combined limiter; `forget` resets the key's backoff on success.
pub struct RateLimitingQueue<K> {
    queue: Arc<WorkQueue<K>>,
    limiter: Mutex<MaxOfRateLimiter<K>>,
}

impl<K: Clone + Eq + Hash + Send + Sync + 'static> RateLimitingQueue<K> {
    /// Create a queue with the given requeue limiter.
    #[must_use]
    pub fn new(limiter: MaxOfRateLimiter<K>) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new()),
            limiter: Mutex::new(limiter),
        }
    }

    /// Insert a key immediately. See [`WorkQueue::add`].
    pub fn add(&self, key: K) {
        self.queue.add(key);
    }

    /// Re-insert a key after its computed backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.lock_limiter().when(&key);
        if delay.is_zero() {
            self.queue.add(key);
            return;
        }
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Reset the key's backoff state after a successful reconcile.
    pub fn forget(&self, key: &K) {
        self.lock_limiter().forget(key);
    }

    /// See [`WorkQueue::get`].
    pub async fn get(&self) -> Option<K> {
        self.queue.get().await
    }

    /// See [`WorkQueue::done`].
    pub fn done(&self, key: &K) {
        self.queue.done(key);
    }

    /// See [`WorkQueue::shut_down`].
    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    /// Number of keys ready for delivery.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no keys are ready for delivery.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn lock_limiter(&self) -> std::sync::MutexGuard<'_, MaxOfRateLimiter<K>> {
        match self.limiter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
