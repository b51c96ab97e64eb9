//! Event selection.
//!
//! An event is selected when each of its type, involved object kind and
//! reason is allowed by the corresponding allow-list. An empty allow-list
//! allows every value.

use crate::error::ConfigError;
use crate::record::ChangeRecord;
use std::collections::BTreeSet;
use std::fmt;

/// Set of accepted values for one event field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList(BTreeSet<String>);

impl AllowList {
    /// Parses a comma-separated list.
    ///
    /// An empty string yields an empty list, which allows everything.
    /// Entries are taken verbatim: `"Warning,"` allows `Warning` and the
    /// empty value. `flag` names the source in error messages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedAllowList`] for an entry with leading
    /// or trailing whitespace.
    pub fn parse(flag: &'static str, raw: &str) -> Result<Self, ConfigError> {
        if raw.is_empty() {
            return Ok(Self::default());
        }

        raw.split(',')
            .map(|entry| {
                if entry.trim() == entry {
                    Ok(entry.to_string())
                } else {
                    Err(ConfigError::MalformedAllowList {
                        flag,
                        entry: entry.to_string(),
                    })
                }
            })
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Whether `value` is allowed. Exact, case-sensitive match.
    pub fn allows(&self, value: &str) -> bool {
        self.0.is_empty() || self.0.contains(value)
    }

    /// Whether the list allows everything.
    pub fn is_open(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<&str> = self.0.iter().map(String::as_str).collect();
        write!(f, "[{}]", entries.join(","))
    }
}

/// The three allow-lists events are selected by.
///
/// Built once at startup and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Accepted event types (`Normal`, `Warning`, ...)
    pub event_types: AllowList,
    /// Accepted involved object kinds (`Pod`, `ConfigMap`, ...)
    pub involved_objects: AllowList,
    /// Accepted reasons (`FailedMount`, ...)
    pub reasons: AllowList,
}

impl FilterConfig {
    /// Builds a filter from the three comma-separated flag values.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any of the lists is malformed.
    pub fn parse(event_types: &str, involved_objects: &str, reasons: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            event_types: AllowList::parse("types", event_types)?,
            involved_objects: AllowList::parse("involved-objects", involved_objects)?,
            reasons: AllowList::parse("reasons", reasons)?,
        })
    }

    /// Whether an event with these field values is selected.
    pub fn accepts(&self, category: &str, related_kind: &str, reason_code: &str) -> bool {
        self.event_types.allows(category)
            && self.involved_objects.allows(related_kind)
            && self.reasons.allows(reason_code)
    }

    /// Whether every event is selected.
    pub fn is_open(&self) -> bool {
        self.event_types.is_open() && self.involved_objects.is_open() && self.reasons.is_open()
    }

    /// Whether `record` is selected.
    pub fn accepts_record<P>(&self, record: &ChangeRecord<P>) -> bool {
        self.accepts(record.category.as_str(), &record.related_kind, &record.reason_code)
    }
}

impl fmt::Display for FilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "types={} involvedObjects={} reasons={}",
            self.event_types, self.involved_objects, self.reasons
        )
    }
}
