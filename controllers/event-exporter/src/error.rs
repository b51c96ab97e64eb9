//! Controller-specific error types.
//!
//! This module defines the error types of the Event Exporter and the
//! process-wide reporter that receives errors for keys that were dropped
//! after exhausting their retries.

use thiserror::Error;
use tracing::error;

/// Errors that can occur while building the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An allow-list entry can never match a real value
    #[error("malformed {flag} allow-list: entry {entry:?} has surrounding whitespace")]
    MalformedAllowList {
        /// Flag the list came from
        flag: &'static str,
        /// Offending entry
        entry: String,
    },

    /// The kubeconfig file could not be loaded
    #[error("Out-of-cluster error: {0}")]
    Kubeconfig(String),

    /// In-cluster configuration is not available
    #[error("In-cluster error: {0}")]
    InCluster(String),

    /// The `--master` URL is not a valid URI
    #[error("Invalid master URL {url:?}: {source}")]
    InvalidMaster {
        /// URL as given
        url: String,
        /// Parse failure
        #[source]
        source: http::uri::InvalidUri,
    },

    /// The Kubernetes client could not be built from the configuration
    #[error("Kubernetes client error: {0}")]
    Client(#[from] kube::Error),
}

/// Errors returned by a watch cache lookup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not of the form `namespace/name` or `name`
    #[error("invalid resource key: {0:?}")]
    InvalidKey(String),

    /// The cache could not serve the lookup right now
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Errors of a single reconcile attempt.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Fetching the object from the cache failed
    #[error("fetching object from store failed: {0}")]
    Cache(#[from] CacheError),

    /// Writing the record to the sink failed
    #[error("writing record failed: {0}")]
    Sink(#[from] std::io::Error),
}

impl ReconcileError {
    /// Whether another attempt can succeed.
    ///
    /// A broken pipe means the reader is gone and part of the line may
    /// already be out; writing the record again would only duplicate it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cache(_) => true,
            Self::Sink(e) => e.kind() != std::io::ErrorKind::BrokenPipe,
        }
    }
}

/// Errors that can occur in the Event Exporter controller lifecycle.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The cache did not finish its initial sync
    #[error("Cache sync failed: {0}")]
    CacheSync(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

/// Receives errors for keys that are dropped after their last retry.
///
/// Reporting is an observability event; it never stops the controller.
pub trait ErrorReporter: Send + Sync {
    /// Reports that `key` was dropped because of `error`.
    fn report(&self, key: &str, error: &ReconcileError);
}

/// Reports dropped keys through `tracing` at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, key: &str, error: &ReconcileError) {
        error!(key, %error, "unhandled error, giving up on key");
    }
}
