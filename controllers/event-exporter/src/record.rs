//! Change records handed from the watch cache to the reconciler.
//!
//! A `ChangeRecord` is built once at the cache boundary so the reconciler
//! works with plain fields instead of inspecting Kubernetes objects.

use k8s_openapi::api::core::v1::Event;
use std::fmt;
use std::sync::Arc;

/// Category of an event (`type` field of a core/v1 Event).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Routine information
    Normal,
    /// Something may need attention
    Warning,
    /// Any other value, including an empty one
    Other(String),
}

impl EventCategory {
    /// Value as it appears on the API object.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for EventCategory {
    fn from(value: &str) -> Self {
        match value {
            "Normal" => Self::Normal,
            "Warning" => Self::Warning,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one observed change.
///
/// `payload` is what gets serialized and emitted; the other fields are what
/// the filter looks at.
#[derive(Debug)]
pub struct ChangeRecord<P> {
    /// Event category (`Normal`, `Warning`, ...)
    pub category: EventCategory,
    /// Kind of the object the change is about
    pub related_kind: String,
    /// Short machine-readable reason
    pub reason_code: String,
    /// Full object, emitted as-is
    pub payload: Arc<P>,
}

impl<P> Clone for ChangeRecord<P> {
    fn clone(&self) -> Self {
        Self {
            category: self.category.clone(),
            related_kind: self.related_kind.clone(),
            reason_code: self.reason_code.clone(),
            payload: Arc::clone(&self.payload),
        }
    }
}

impl ChangeRecord<Event> {
    /// Builds a record from a cached core/v1 Event.
    ///
    /// Missing fields become empty strings, which only match allow-lists
    /// that contain the empty string.
    pub fn from_event(event: Arc<Event>) -> Self {
        Self {
            category: EventCategory::from(event.type_.as_deref().unwrap_or_default()),
            related_kind: event.involved_object.kind.clone().unwrap_or_default(),
            reason_code: event.reason.clone().unwrap_or_default(),
            payload: event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_event;

    #[test]
    fn test_from_event_extracts_filter_fields() {
        let event = create_test_event("default", "pod-1", Some("Warning"), Some("Pod"), Some("FailedMount"));
        let record = ChangeRecord::from_event(Arc::new(event));

        assert_eq!(record.category, EventCategory::Warning);
        assert_eq!(record.related_kind, "Pod");
        assert_eq!(record.reason_code, "FailedMount");
        assert_eq!(record.payload.metadata.name.as_deref(), Some("pod-1"));
    }

    #[test]
    fn test_from_event_missing_fields_are_empty() {
        let event = create_test_event("default", "bare", None, None, None);
        let record = ChangeRecord::from_event(Arc::new(event));

        assert_eq!(record.category, EventCategory::Other(String::new()));
        assert_eq!(record.category.as_str(), "");
        assert_eq!(record.related_kind, "");
        assert_eq!(record.reason_code, "");
    }

    #[test]
    fn test_category_round_trips_through_str() {
        assert_eq!(EventCategory::from("Normal").as_str(), "Normal");
        assert_eq!(EventCategory::from("Warning").as_str(), "Warning");
        // Case-sensitive: not folded into Warning
        assert_eq!(EventCategory::from("warning"), EventCategory::Other("warning".to_string()));
    }
}
