//! Kubernetes Event watcher.
//!
//! This module drives the list/watch stream for Events, keeps the reflector
//! store behind [`EventCache`] up to date and hands the key of every
//! changed object to the controller over a channel.

use crate::cache::{EventCache, object_key};
use crate::error::ControllerError;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kube::Api;
use kube_runtime::reflector::{self, store::Writer};
use kube_runtime::{WatchStreamExt, watcher};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Watches Events and feeds the cache and the controller's key channel.
pub struct Watcher {
    api: Api<Event>,
    writer: Writer<Event>,
    synced: Arc<AtomicBool>,
    keys: UnboundedSender<String>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a watcher and the cache it keeps in sync.
    pub fn new(api: Api<Event>, keys: UnboundedSender<String>) -> (Self, EventCache) {
        let (store, writer) = reflector::store();
        let synced = Arc::new(AtomicBool::new(false));
        let cache = EventCache::new(store, Arc::clone(&synced));
        (
            Self {
                api,
                writer,
                synced,
                keys,
            },
            cache,
        )
    }

    /// Runs the watch until the controller stops listening for keys.
    ///
    /// Stream errors are logged and retried with the default watcher
    /// backoff; they never end the watch.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::Watch`] if the watch stream ends.
    pub async fn watch_events(self) -> Result<(), ControllerError> {
        info!("Starting Event watcher");

        let Self {
            api,
            writer,
            synced,
            keys,
        } = self;
        let mut stream = pin!(reflector::reflector(writer, watcher(api, watcher::Config::default())).default_backoff());
        let mut batcher = KeyBatcher::default();

        while let Some(result) = stream.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    warn!("Event watcher stream error (retrying with backoff): {}", e);
                    continue;
                }
            };

            match &event {
                watcher::Event::Apply(event) => trace!(name = ?event.metadata.name, "Event applied"),
                watcher::Event::Delete(event) => trace!(name = ?event.metadata.name, "Event deleted"),
                watcher::Event::Init => debug!("Event watcher (re)listing"),
                watcher::Event::InitApply(event) => trace!(name = ?event.metadata.name, "Event init apply"),
                watcher::Event::InitDone => {
                    if !synced.swap(true, Ordering::AcqRel) {
                        info!("Event watcher initialization complete");
                    }
                }
            }

            for key in batcher.keys_for(&event) {
                if keys.send(key).is_err() {
                    debug!("key receiver closed, stopping Event watcher");
                    return Ok(());
                }
            }
        }

        Err(ControllerError::Watch("Event watch stream ended".to_string()))
    }
}

/// Decides which keys a watch event hands to the controller.
///
/// The reflector only swaps a (re)listed page into the store on `InitDone`,
/// so keys seen during a list are held back until then. Otherwise workers
/// would look them up in the previous store and find nothing.
#[derive(Debug, Default)]
struct KeyBatcher {
    listed: Vec<String>,
}

impl KeyBatcher {
    /// Keys to send after the reflector has applied `event`.
    fn keys_for(&mut self, event: &watcher::Event<Event>) -> Vec<String> {
        match event {
            watcher::Event::Apply(event) | watcher::Event::Delete(event) => {
                object_key(&event.metadata).into_iter().collect()
            }
            watcher::Event::Init => {
                // A restarted list replaces whatever the interrupted one saw
                self.listed.clear();
                Vec::new()
            }
            watcher::Event::InitApply(event) => {
                self.listed.extend(object_key(&event.metadata));
                Vec::new()
            }
            watcher::Event::InitDone => std::mem::take(&mut self.listed),
        }
    }
}
