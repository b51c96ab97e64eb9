//! Watch cache the reconciler reads from.
//!
//! The cache is kept in sync by the [`watcher`](crate::watcher) task; the
//! reconciler only looks objects up by key and asks whether the initial
//! list has completed.

use crate::error::CacheError;
use crate::record::ChangeRecord;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::reflector::{ObjectRef, Store};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read side of a watch cache.
pub trait WatchCache: Send + Sync + 'static {
    /// Object emitted for accepted records
    type Payload: Serialize + Send + Sync + 'static;

    /// Looks up the current state of `key`.
    ///
    /// `Ok(None)` means the object is gone, e.g. deleted between the
    /// notification and the lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`CacheError`] if the lookup could not be served.
    fn lookup(&self, key: &str) -> Result<Option<ChangeRecord<Self::Payload>>, CacheError>;

    /// Whether the initial list has been loaded into the cache.
    fn has_synced(&self) -> bool;
}

/// Builds the cache key of an object: `namespace/name`, or `name` for
/// cluster-scoped objects.
pub fn object_key(meta: &ObjectMeta) -> Option<String> {
    let name = meta.name.as_deref()?;
    Some(match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    })
}

/// Splits a key built by [`object_key`] into namespace and name.
///
/// # Errors
///
/// Returns [`CacheError::InvalidKey`] for empty names or more than one `/`.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str), CacheError> {
    let invalid = || CacheError::InvalidKey(key.to_string());
    match key.split_once('/') {
        None if !key.is_empty() => Ok((None, key)),
        Some((namespace, name)) if !name.is_empty() && !name.contains('/') => {
            Ok(((!namespace.is_empty()).then_some(namespace), name))
        }
        _ => Err(invalid()),
    }
}

/// Event cache backed by a `kube_runtime` reflector store.
#[derive(Clone)]
pub struct EventCache {
    store: Store<Event>,
    synced: Arc<AtomicBool>,
}

impl fmt::Debug for EventCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCache")
            .field("synced", &self.has_synced())
            .finish_non_exhaustive()
    }
}

impl EventCache {
    /// Wraps `store`; `synced` is flipped by the watcher once the initial
    /// list is complete.
    pub fn new(store: Store<Event>, synced: Arc<AtomicBool>) -> Self {
        Self { store, synced }
    }
}

impl WatchCache for EventCache {
    type Payload = Event;

    fn lookup(&self, key: &str) -> Result<Option<ChangeRecord<Event>>, CacheError> {
        if !self.has_synced() {
            // An unsynced store cannot tell "deleted" from "not listed yet"
            return Err(CacheError::Unavailable("initial list not complete".to_string()));
        }
        let (namespace, name) = split_key(key)?;
        let mut object_ref = ObjectRef::<Event>::new(name);
        if let Some(namespace) = namespace {
            object_ref = object_ref.within(namespace);
        }
        Ok(self.store.get(&object_ref).map(ChangeRecord::from_event))
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
