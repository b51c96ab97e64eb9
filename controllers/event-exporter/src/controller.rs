//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the watch cache,
//! the work queue, the filter and the sink together and drives the
//! lifecycle:
//!
//! `Created → Syncing → Running → ShuttingDown → Stopped`
//!
//! A cache that does not sync before the stop signal (or the optional
//! timeout) moves the controller straight to `Stopped` without starting any
//! worker.

use crate::cache::WatchCache;
use crate::error::{ControllerError, ErrorReporter, LogErrorReporter};
use crate::filter::FilterConfig;
use crate::reconciler::{DEFAULT_MAX_RETRIES, Reconciler};
use crate::sink::RecordSink;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use workqueue::{RateLimiter, RateLimitingQueue, default_controller_rate_limiter};

/// How often the cache is asked whether it has synced.
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause before a crashed worker is started again.
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Dependencies wired, nothing started
    Created,
    /// Waiting for the initial cache sync
    Syncing,
    /// Workers are processing keys
    Running,
    /// Queue shut down, workers draining
    ShuttingDown,
    /// Terminal
    Stopped,
}

/// Main controller for Event export.
pub struct Controller<C, S> {
    cache: Arc<C>,
    keys: mpsc::UnboundedReceiver<String>,
    filter: Arc<FilterConfig>,
    sink: Arc<S>,
    limiter: Arc<dyn RateLimiter<String>>,
    reporter: Arc<dyn ErrorReporter>,
    threadiness: usize,
    max_retries: u32,
    cache_sync_timeout: Option<Duration>,
    state: watch::Sender<ControllerState>,
}

impl<C, S> std::fmt::Debug for Controller<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("filter", &self.filter)
            .field("threadiness", &self.threadiness)
            .field("max_retries", &self.max_retries)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<C, S> Controller<C, S>
where
    C: WatchCache,
    S: RecordSink,
{
    /// Creates a new controller instance.
    ///
    /// `keys` receives the key of every object the watcher saw change.
    pub fn new(cache: Arc<C>, keys: mpsc::UnboundedReceiver<String>, filter: FilterConfig, sink: S) -> Self {
        let (state, _) = watch::channel(ControllerState::Created);
        Self {
            cache,
            keys,
            filter: Arc::new(filter),
            sink: Arc::new(sink),
            limiter: Arc::new(default_controller_rate_limiter::<String>()),
            reporter: Arc::new(LogErrorReporter),
            threadiness: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            cache_sync_timeout: None,
            state,
        }
    }

    /// Number of concurrent workers (at least 1).
    #[must_use]
    pub fn with_threadiness(mut self, threadiness: usize) -> Self {
        self.threadiness = threadiness.max(1);
        self
    }

    /// Failed attempts after which a key is dropped.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Gives up on the initial cache sync after `timeout`.
    #[must_use]
    pub fn with_cache_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    /// Replaces the default controller rate limiter.
    #[cfg(test)]
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter<String>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Follows the lifecycle state.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Runs the controller until `shutdown` is cancelled.
    ///
    /// `informer` keeps the cache in sync and feeds the key channel; it is
    /// spawned here and aborted on the way out.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::CacheSync`] if the cache did not sync and
    /// [`ControllerError::Watch`] if the informer stopped on its own.
    pub async fn run<F>(self, informer: F, shutdown: CancellationToken) -> Result<(), ControllerError>
    where
        F: Future<Output = Result<(), ControllerError>> + Send + 'static,
    {
        let Self {
            cache,
            keys,
            filter,
            sink,
            limiter,
            reporter,
            threadiness,
            max_retries,
            cache_sync_timeout,
            state,
        } = self;

        info!("Starting event exporter selecting {}", filter);
        if filter.is_open() {
            info!("No allow-lists configured, exporting every event");
        }
        let queue = RateLimitingQueue::with_shared_limiter("events", limiter);

        state.send_replace(ControllerState::Syncing);
        let mut informer = tokio::spawn(informer);
        let forwarder = tokio::spawn(forward_keys(keys, queue.clone()));

        if let Err(e) = wait_for_cache_sync(cache.as_ref(), cache_sync_timeout, &shutdown, &mut informer).await {
            error!("{}", e);
            queue.shut_down();
            informer.abort();
            forwarder.abort();
            state.send_replace(ControllerState::Stopped);
            return Err(e);
        }
        info!("Caches synced, starting {} worker(s)", threadiness);

        let reconciler = Arc::new(Reconciler::new(cache, queue.clone(), filter, sink, reporter, max_retries));
        let mut workers = JoinSet::new();
        for worker in 0..threadiness {
            workers.spawn(supervise_worker(Arc::clone(&reconciler), worker));
        }
        state.send_replace(ControllerState::Running);

        let result = tokio::select! {
            () = shutdown.cancelled() => {
                info!("Stopping event exporter");
                Ok(())
            }
            joined = &mut informer => {
                let e = informer_exit(joined);
                error!("{}", e);
                Err(e)
            }
        };

        state.send_replace(ControllerState::ShuttingDown);
        queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        informer.abort();
        forwarder.abort();

        state.send_replace(ControllerState::Stopped);
        info!("Event exporter stopped");
        result
    }
}

/// Runs `worker` until the queue shuts down, starting it again
/// [`WORKER_RESTART_DELAY`] after a panic.
async fn supervise_worker<C, S>(reconciler: Arc<Reconciler<C, S>>, worker: usize)
where
    C: WatchCache,
    S: RecordSink,
{
    loop {
        match tokio::spawn(Arc::clone(&reconciler).run_worker(worker)).await {
            Ok(()) => return,
            Err(e) => {
                error!(worker, "Worker panicked, restarting in {:?}: {}", WORKER_RESTART_DELAY, e);
                tokio::time::sleep(WORKER_RESTART_DELAY).await;
            }
        }
    }
}

/// Moves keys from the watcher channel into the work queue.
async fn forward_keys(mut keys: mpsc::UnboundedReceiver<String>, queue: RateLimitingQueue<String>) {
    while let Some(key) = keys.recv().await {
        queue.add(key);
    }
    debug!("key channel closed");
}

/// Waits until the cache has synced.
///
/// Fails if `shutdown` is cancelled, the timeout expires or the informer
/// exits first.
async fn wait_for_cache_sync<C: WatchCache>(
    cache: &C,
    timeout: Option<Duration>,
    shutdown: &CancellationToken,
    informer: &mut JoinHandle<Result<(), ControllerError>>,
) -> Result<(), ControllerError> {
    info!("Waiting for caches to sync");
    let synced = async {
        let mut interval = tokio::time::interval(CACHE_SYNC_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if cache.has_synced() {
                return;
            }
        }
    };
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        () = synced => Ok(()),
        () = shutdown.cancelled() => Err(ControllerError::CacheSync(
            "stopped while waiting for caches to sync".to_string(),
        )),
        () = deadline => Err(ControllerError::CacheSync(
            "timed out waiting for caches to sync".to_string(),
        )),
        joined = informer => Err(informer_exit(joined)),
    }
}

fn informer_exit(joined: Result<Result<(), ControllerError>, tokio::task::JoinError>) -> ControllerError {
    match joined {
        Ok(Ok(())) => ControllerError::Watch("informer exited".to_string()),
        Ok(Err(e)) => e,
        Err(e) => ControllerError::Watch(format!("informer panicked: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    fn open_controller(
        cache: Arc<FakeCache>,
        sink: MemorySink,
    ) -> (Controller<FakeCache, MemorySink>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Controller::new(cache, rx, FilterConfig::default(), sink)
            .with_rate_limiter(Arc::new(RecordingRateLimiter::default()));
        (controller, tx)
    }

    async fn informer_forever() -> Result<(), ControllerError> {
        std::future::pending().await
    }

    #[tokio::test]
    async fn test_run_processes_keys_until_stopped() {
        let cache = Arc::new(FakeCache::new());
        cache.insert("ns/pod-1", create_test_record("Warning", "Pod", "FailedMount"));
        cache.insert("ns/pod-2", create_test_record("Normal", "Pod", "Pulled"));
        let (controller, tx) = open_controller(Arc::clone(&cache), MemorySink::default());
        let controller = controller.with_threadiness(2);
        let mut states = controller.subscribe();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(controller.run(informer_forever(), shutdown.clone()));

        states
            .wait_for(|state| *state == ControllerState::Running)
            .await
            .unwrap();
        tx.send("ns/pod-1".to_string()).unwrap();
        tx.send("ns/pod-2".to_string()).unwrap();
        tx.send("ns/gone".to_string()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while cache.lookups() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(*states.borrow(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_worker_is_restarted() {
        let cache = Arc::new(FakeCache::new());
        cache.insert("ns/pod-1", create_test_record("Warning", "Pod", "FailedMount"));
        cache.insert("ns/pod-2", create_test_record("Warning", "Pod", "BackOff"));
        cache.panic_next("ns/pod-1");
        let (controller, tx) = open_controller(Arc::clone(&cache), MemorySink::default());
        let mut states = controller.subscribe();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(controller.run(informer_forever(), shutdown.clone()));
        states
            .wait_for(|state| *state == ControllerState::Running)
            .await
            .unwrap();

        tx.send("ns/pod-1".to_string()).unwrap();
        tx.send("ns/pod-2".to_string()).unwrap();

        // The only worker dies on the first key; the second needs its replacement
        tokio::time::timeout(Duration::from_secs(30), async {
            while cache.lookups() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*states.borrow(), ControllerState::Running);

        shutdown.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_sync_starts_no_workers() {
        let cache = Arc::new(FakeCache::new());
        cache.set_synced(false);
        cache.insert("ns/pod-1", create_test_record("Warning", "Pod", "FailedMount"));
        let (controller, tx) = open_controller(Arc::clone(&cache), MemorySink::default());
        let states = controller.subscribe();
        tx.send("ns/pod-1".to_string()).unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(controller.run(informer_forever(), shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*states.borrow(), ControllerState::Syncing);

        shutdown.cancel();
        let result = run.await.unwrap();
        assert!(matches!(result, Err(ControllerError::CacheSync(_))));
        assert_eq!(*states.borrow(), ControllerState::Stopped);
        assert_eq!(cache.lookups(), 0, "no worker may run before the cache syncs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_sync_timeout() {
        let cache = Arc::new(FakeCache::new());
        cache.set_synced(false);
        let (controller, _tx) = open_controller(Arc::clone(&cache), MemorySink::default());
        let controller = controller.with_cache_sync_timeout(Some(Duration::from_secs(30)));

        let result = controller
            .run(informer_forever(), CancellationToken::new())
            .await;

        match result {
            Err(ControllerError::CacheSync(message)) => assert!(message.contains("timed out")),
            other => panic!("expected cache sync timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_informer_failure_before_sync_is_reported() {
        let cache = Arc::new(FakeCache::new());
        cache.set_synced(false);
        let (controller, _tx) = open_controller(cache, MemorySink::default());

        let informer = async { Err(ControllerError::Watch("list failed".to_string())) };
        let result = controller.run(informer, CancellationToken::new()).await;

        match result {
            Err(ControllerError::Watch(message)) => assert_eq!(message, "list failed"),
            other => panic!("expected watch error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_informer_exit_while_running_stops_controller() {
        let cache = Arc::new(FakeCache::new());
        let (controller, _tx) = open_controller(cache, MemorySink::default());
        let states = controller.subscribe();

        let informer = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        };
        let result = controller.run(informer, CancellationToken::new()).await;

        assert!(matches!(result, Err(ControllerError::Watch(_))));
        assert_eq!(*states.borrow(), ControllerState::Stopped);
    }
}
