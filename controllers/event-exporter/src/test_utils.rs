//! Test utilities for unit testing the reconciler and controller
//!
//! This module provides fakes for the watch cache, the output sink, the
//! rate limiter and the error reporter, plus helpers for creating test
//! Events.

use crate::cache::WatchCache;
use crate::error::{CacheError, ErrorReporter, ReconcileError};
use crate::record::{ChangeRecord, EventCategory};
use crate::sink::RecordSink;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use workqueue::RateLimiter;

/// Helper to create a test core/v1 Event
pub fn create_test_event(
    namespace: &str,
    name: &str,
    event_type: Option<&str>,
    kind: Option<&str>,
    reason: Option<&str>,
) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: event_type.map(str::to_string),
        involved_object: ObjectReference {
            kind: kind.map(str::to_string),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        reason: reason.map(str::to_string),
        ..Default::default()
    }
}

/// Helper to create a record with a JSON payload
pub fn create_test_record(category: &str, kind: &str, reason: &str) -> ChangeRecord<serde_json::Value> {
    ChangeRecord {
        category: EventCategory::from(category),
        related_kind: kind.to_string(),
        reason_code: reason.to_string(),
        payload: Arc::new(serde_json::json!({
            "type": category,
            "involvedObject": { "kind": kind },
            "reason": reason,
        })),
    }
}

/// In-memory watch cache with scriptable lookup failures
pub struct FakeCache<P = serde_json::Value> {
    records: Mutex<HashMap<String, ChangeRecord<P>>>,
    failures: Mutex<HashMap<String, u32>>,
    panics: Mutex<HashSet<String>>,
    synced: AtomicBool,
    lookups: AtomicUsize,
}

impl<P> FakeCache<P> {
    /// Create an empty, already synced cache
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
            synced: AtomicBool::new(true),
            lookups: AtomicUsize::new(0),
        }
    }

    /// Add a record under `key` (for test setup)
    pub fn insert(&self, key: &str, record: ChangeRecord<P>) {
        self.records.lock().unwrap().insert(key.to_string(), record);
    }

    /// Make the next `times` lookups of `key` fail
    pub fn fail_next(&self, key: &str, times: u32) {
        self.failures.lock().unwrap().insert(key.to_string(), times);
    }

    /// Make the next lookup of `key` panic
    pub fn panic_next(&self, key: &str) {
        self.panics.lock().unwrap().insert(key.to_string());
    }

    /// Set the value reported by `has_synced`
    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::SeqCst);
    }

    /// Number of lookups performed so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl<P> WatchCache for FakeCache<P>
where
    P: Serialize + Send + Sync + 'static,
{
    type Payload = P;

    fn lookup(&self, key: &str) -> Result<Option<ChangeRecord<P>>, CacheError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let should_panic = self.panics.lock().unwrap().remove(key);
        if should_panic {
            panic!("injected panic for {key}");
        }
        if let Some(remaining) = self.failures.lock().unwrap().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CacheError::Unavailable(format!("injected failure for {key}")));
            }
        }
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Sink collecting records in memory
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<String>>,
    fail: Mutex<Option<io::ErrorKind>>,
}

impl MemorySink {
    /// Records written so far, one string per line
    pub fn records(&self) -> Vec<String> {
        self.records.lock().unwrap().clone()
    }

    /// Make every write fail with a transient error until switched back
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail.then_some(io::ErrorKind::Other);
    }

    /// Make every write fail with `kind`
    pub fn fail_with(&self, kind: io::ErrorKind) {
        *self.fail.lock().unwrap() = Some(kind);
    }
}

impl RecordSink for MemorySink {
    fn write_record(&self, record: &[u8]) -> io::Result<()> {
        if let Some(kind) = *self.fail.lock().unwrap() {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        self.records
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(record).into_owned());
        Ok(())
    }
}

/// Rate limiter that never delays and counts how it is used
#[derive(Default)]
pub struct RecordingRateLimiter {
    failures: Mutex<HashMap<String, u32>>,
    when_calls: AtomicUsize,
    forget_calls: AtomicUsize,
}

impl RecordingRateLimiter {
    /// Number of rate-limited re-adds
    pub fn when_calls(&self) -> usize {
        self.when_calls.load(Ordering::SeqCst)
    }

    /// Number of forget calls
    pub fn forget_calls(&self) -> usize {
        self.forget_calls.load(Ordering::SeqCst)
    }
}

impl RateLimiter<String> for RecordingRateLimiter {
    fn when(&self, key: &String) -> Duration {
        self.when_calls.fetch_add(1, Ordering::SeqCst);
        *self.failures.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        Duration::ZERO
    }

    fn forget(&self, key: &String) {
        self.forget_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.lock().unwrap().remove(key);
    }

    fn num_requeues(&self, key: &String) -> u32 {
        self.failures.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

/// Error reporter remembering every dropped key
#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingReporter {
    /// `(key, error message)` pairs reported so far
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, key: &str, error: &ReconcileError) {
        self.reports
            .lock()
            .unwrap()
            .push((key.to_string(), error.to_string()));
    }
}

/// Payload whose serialization always fails
pub struct Unserializable;

impl Serialize for Unserializable {
    fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("payload refuses to serialize"))
    }
}
