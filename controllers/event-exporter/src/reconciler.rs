//! Reconciliation logic for Event keys.
//!
//! Every worker runs the same loop: take a key from the queue, look it up
//! in the watch cache, filter it and write it to the sink if selected.
//! Failed attempts are retried with backoff up to the retry ceiling, after
//! which the key is dropped and reported. Errors that cannot clear on
//! their own are dropped right away.

use crate::cache::WatchCache;
use crate::error::{ErrorReporter, ReconcileError};
use crate::filter::FilterConfig;
use crate::sink::RecordSink;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use workqueue::RateLimitingQueue;

/// Consecutive failed attempts after which a key is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// What a successful attempt did with its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The record was written to the sink
    Emitted,
    /// The record did not pass the filter
    Filtered,
    /// The object is no longer in the cache
    Absent,
    /// The record could not be serialized and was skipped
    Unserializable,
}

/// Releases the in-flight marker of a key on every exit path.
struct InFlight<'a> {
    queue: &'a RateLimitingQueue<String>,
    key: &'a String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// Reconciles Event keys taken from the work queue.
pub struct Reconciler<C, S> {
    cache: Arc<C>,
    queue: RateLimitingQueue<String>,
    filter: Arc<FilterConfig>,
    sink: Arc<S>,
    reporter: Arc<dyn ErrorReporter>,
    max_retries: u32,
}

impl<C, S> std::fmt::Debug for Reconciler<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("queue", &self.queue)
            .field("filter", &self.filter)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<C, S> Reconciler<C, S>
where
    C: WatchCache,
    S: RecordSink,
{
    /// Creates a new reconciler instance.
    pub fn new(
        cache: Arc<C>,
        queue: RateLimitingQueue<String>,
        filter: Arc<FilterConfig>,
        sink: Arc<S>,
        reporter: Arc<dyn ErrorReporter>,
        max_retries: u32,
    ) -> Self {
        Self {
            cache,
            queue,
            filter,
            sink,
            reporter,
            max_retries,
        }
    }

    /// Processes keys until the queue is shut down and drained.
    pub async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!(worker, "worker started");
        while self.process_next_item().await {}
        debug!(worker, "worker stopped");
    }

    /// Takes one key from the queue and reconciles it.
    ///
    /// Returns `false` once the queue is shut down, telling the worker to
    /// exit.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let _in_flight = InFlight {
            queue: &self.queue,
            key: &key,
        };

        let result = self.sync_key(&key);
        self.handle_result(&key, result);
        true
    }

    /// Looks `key` up, filters it and emits it.
    fn sync_key(&self, key: &str) -> Result<SyncOutcome, ReconcileError> {
        let record = match self.cache.lookup(key) {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Deleted between notification and processing
                trace!(key, "object no longer in cache");
                return Ok(SyncOutcome::Absent);
            }
            Err(e) => {
                error!(key, "fetching object from store failed: {}", e);
                return Err(e.into());
            }
        };

        if !self.filter.accepts_record(&record) {
            trace!(
                key,
                category = %record.category,
                kind = %record.related_kind,
                reason = %record.reason_code,
                "event filtered out"
            );
            return Ok(SyncOutcome::Filtered);
        }

        let line = match serde_json::to_vec(&*record.payload) {
            Ok(line) => line,
            Err(e) => {
                // Serializing again cannot give a different result
                error!(key, "failed to serialize event, skipping: {}", e);
                return Ok(SyncOutcome::Unserializable);
            }
        };

        self.sink.write_record(&line)?;
        Ok(SyncOutcome::Emitted)
    }

    /// Clears retry state on success, schedules a retry on failure and
    /// drops the key once it has failed too often or cannot succeed.
    fn handle_result(&self, key: &String, result: Result<SyncOutcome, ReconcileError>) {
        let error = match result {
            Ok(outcome) => {
                trace!(key = %key, ?outcome, "reconciled");
                self.queue.forget(key);
                return;
            }
            Err(error) => error,
        };

        let requeues = self.queue.num_requeues(key);
        if error.is_retryable() && requeues < self.max_retries {
            warn!(key = %key, requeues, "can't sync event, retrying: {}", error);
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        self.reporter.report(key, &error);
        info!(key = %key, requeues, "dropping event from the queue: {}", error);
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
