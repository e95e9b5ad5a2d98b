//! # Work queue module
//!
//! This module provides the deduplicated, rate-limited work queue (component
//! D) that is the central concurrency invariant of the runtime: at most one
//! worker may hold a given key at a time. Hand-rolled over
//! `tokio::sync::{Mutex, Notify}` rather than reusing `kube::runtime`'s
//! scheduler, which is reflector/stream-shaped rather than key/dedup-shaped
//! (see DESIGN.md).

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    time::Duration,
};

use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tracing::trace;

// -----------------------------------------------------------------------------
// constants

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

// -----------------------------------------------------------------------------
// Inner

struct Inner<K> {
    /// keys waiting to be dequeued, in FIFO order, deduplicated against both
    /// `queued` and `processing`.
    pending: VecDeque<K>,
    /// mirrors `pending`'s contents for O(1) membership checks.
    queued: HashSet<K>,
    /// keys currently held by a worker; `add` on a processing key only marks
    /// it `dirty` so it is requeued exactly once after `done`.
    processing: HashSet<K>,
    dirty: HashSet<K>,
    /// per-key retry count, reset by `forget` after a successful `done`.
    retries: std::collections::HashMap<K, u32>,
    closed: bool,
}

// -----------------------------------------------------------------------------
// Queue

/// a FIFO of opaque keys with add-time dedup, a processing set preventing two
/// workers from holding the same key simultaneously, and rate-limited
/// requeue with exponential backoff.
pub struct Queue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K> Queue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                retries: std::collections::HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// enqueues `key` immediately; a no-op if the key is already queued, or a
    /// deferred requeue if the key is currently being processed.
    pub async fn add(&self, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }

        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return;
        }

        if inner.queued.insert(key.clone()) {
            inner.pending.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// blocks until a key is available, then marks it `processing` and
    /// returns it. Returns `None` once the queue is closed and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.pending.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    return Some(key);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// marks `key` no longer processing; if it was marked `dirty` while
    /// processing (a concurrent `add`), it is immediately requeued.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);

        if inner.dirty.remove(key) && inner.queued.insert(key.clone()) {
            inner.pending.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
            return;
        }

        inner.retries.remove(key);
    }

    /// requeues `key` after an exponential backoff proportional to its retry
    /// count, capped at `max_delay`. Call alongside `done`, not instead of it.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut inner = self.inner.lock().await;
            let count = inner.retries.entry(key.clone()).or_insert(0);
            let exponent = (*count).min(32);
            *count += 1;
            self.base_delay
                .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
                .min(self.max_delay)
        };

        // +/-20% jitter so many keys backed off at the same exponent don't
        // all wake and hit the api server in the same instant.
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let delay = delay.mul_f64(jitter);

        trace!(delay_ms = delay.as_millis() as u64, "rate limiting requeue");
        tokio::time::sleep(delay).await;
        self.add(key).await;
    }

    /// stops accepting new `add`s for keys not already processing, and wakes
    /// every blocked `get` to observe closure once pending work drains.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

impl<K> Default for Queue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedups_keys_queued_twice() {
        let queue: Queue<String> = Queue::new();
        queue.add("a".to_string()).await;
        queue.add("a".to_string()).await;

        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await, Some("a".to_string()));
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn requeues_dirty_key_added_while_processing() {
        let queue: Queue<String> = Queue::new();
        queue.add("a".to_string()).await;
        let key = queue.get().await.unwrap();

        // a second add while "a" is processing marks it dirty instead of
        // requeuing immediately, preserving at-most-one-in-flight.
        queue.add(key.clone()).await;
        assert_eq!(queue.len().await, 0);

        queue.done(&key).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn close_unblocks_pending_get() {
        let queue: Queue<String> = Queue::new();
        queue.close().await;
        assert_eq!(queue.get().await, None);
    }

    #[test]
    fn get_blocks_on_an_empty_queue_until_add_wakes_it() {
        let queue: Queue<String> = Queue::new();
        let mut get = tokio_test::task::spawn(queue.get());
        tokio_test::assert_pending!(get.poll());

        tokio_test::block_on(queue.add("a".to_string()));
        tokio_test::assert_ready_eq!(get.poll(), Some("a".to_string()));
    }
}
