//! Deduplicating work queue.
//!
//! Keys move through three states:
//! - **dirty**: the key needs processing;
//! - **queued**: the key is dirty and waiting in the FIFO for a worker;
//! - **processing**: a worker holds the key between `get` and `done`.
//!
//! A key added while it is processing stays dirty but is kept out of the
//! FIFO until `done` is called, so it is never processed concurrently.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, trace};

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Shared<K> {
    name: String,
    state: Mutex<State<K>>,
    /// Wakes workers parked in `get`
    notify: Notify,
    /// Cancels pending delayed adds on shutdown
    shutdown: watch::Sender<bool>,
}

/// A deduplicating FIFO of keys shared by a pool of workers.
///
/// Cloning the queue is cheap and yields another handle to the same queue.
pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static,
{
    /// Creates a new, empty queue.
    ///
    /// The name only shows up in log fields.
    pub fn new(name: impl Into<String>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    // A panicking worker must not wedge every other worker, so a poisoned
    // lock is recovered. The state is only mutated in short, panic-free
    // sections.
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing.
    ///
    /// Adding a key that is already waiting is a no-op. Adding a key that is
    /// being processed defers it until the current attempt calls [`done`].
    /// Keys added after [`shut_down`] are ignored.
    ///
    /// [`done`]: WorkQueue::done
    /// [`shut_down`]: WorkQueue::shut_down
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!(queue = %self.shared.name, ?key, "queue shutting down, ignoring add");
            return;
        }
        if state.dirty.contains(&key) {
            trace!(queue = %self.shared.name, ?key, "key already pending");
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(queue = %self.shared.name, ?key, "key in flight, deferring until done");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Adds `key` once `delay` has elapsed.
    ///
    /// A zero delay adds immediately. Delayed adds still pending when the
    /// queue shuts down are discarded. Must be called from within a Tokio
    /// runtime when `delay` is non-zero.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }

        debug!(queue = %self.shared.name, ?key, ?delay, "scheduling delayed add");
        let queue = self.clone();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => queue.add(key),
                _ = shutdown.wait_for(|closed| *closed) => {
                    trace!(queue = %queue.shared.name, ?key, "dropping delayed add on shutdown");
                }
            }
        });
    }

    /// Waits for the next key to process.
    ///
    /// Returns `None` once the queue has been shut down and every queued key
    /// has been handed out. The returned key is in flight until [`done`] is
    /// called for it.
    ///
    /// [`done`]: WorkQueue::done
    pub async fn get(&self) -> Option<K> {
        loop {
            // Registered before checking the state so that a wakeup between
            // the check and the await is not lost.
            let notified = self.shared.notify.notified();
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks the current attempt for `key` as finished.
    ///
    /// If the key was added again while it was processing it is queued now.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if !state.dirty.contains(key) {
            return;
        }

        trace!(queue = %self.shared.name, ?key, "re-queueing key added while in flight");
        state.queue.push_back(key.clone());
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Number of keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is waiting for a worker.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Stops accepting new keys.
    ///
    /// Workers blocked in [`get`] are woken; they keep receiving the keys
    /// that are still queued and get `None` once the queue is drained.
    ///
    /// [`get`]: WorkQueue::get
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
        }
        debug!(queue = %self.shared.name, "shutting down work queue");
        self.shared.shutdown.send_replace(true);
        self.shared.notify.notify_waiters();
    }

    /// Whether [`shut_down`] has been called.
    ///
    /// [`shut_down`]: WorkQueue::shut_down
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
