//! Metadata keys and grouping
//!
//! Every incoming (tag, timestamp, record) triple maps to exactly one
//! `MetadataKey`. Which components participate is chosen at configuration
//! time via `GroupKeys`: the reserved names `time` and `tag` select the
//! time-window and tag components, anything else names a record field whose
//! value becomes part of the key.

use crate::Record;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Reserved chunk-key word selecting the time-window component.
pub const KEY_TIME: &str = "time";
/// Reserved chunk-key word selecting the tag component.
pub const KEY_TAG: &str = "tag";

/// Immutable grouping key for one chunk.
///
/// Equality and ordering are by value. `timekey` is the truncated start of
/// the chunk's time window; the window itself is
/// `[timekey, timekey + timekey_range)`. Missing variable fields are kept
/// as `None` so that two records missing the same field still group
/// together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetadataKey {
    pub timekey: Option<i64>,
    pub tag: Option<String>,
    pub variables: Option<Vec<Option<String>>>,
}

impl MetadataKey {
    /// Key with no active components (single unkeyed chunk stream).
    pub fn empty() -> Self {
        Self {
            timekey: None,
            tag: None,
            variables: None,
        }
    }

    /// End of the time window, if this key is time-based.
    pub fn window_end(&self, timekey_range_secs: i64) -> Option<i64> {
        self.timekey.map(|tk| tk + timekey_range_secs)
    }
}

impl std::fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(tk) = self.timekey {
            parts.push(format!("timekey={}", tk));
        }
        if let Some(tag) = &self.tag {
            parts.push(format!("tag={}", tag));
        }
        if let Some(vars) = &self.variables {
            let rendered: Vec<&str> = vars
                .iter()
                .map(|v| v.as_deref().unwrap_or("<missing>"))
                .collect();
            parts.push(format!("variables=[{}]", rendered.join(",")));
        }
        if parts.is_empty() {
            write!(f, "<unkeyed>")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Truncate an event timestamp (unix seconds) to the start of its window.
pub fn timekey_for(unix_secs: i64, timekey_range_secs: i64) -> i64 {
    unix_secs - unix_secs.rem_euclid(timekey_range_secs)
}

/// Active key components, parsed from the configured `chunk_keys` list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupKeys {
    time: bool,
    tag: bool,
    fields: Vec<String>,
}

impl GroupKeys {
    pub fn parse<S: AsRef<str>>(chunk_keys: &[S]) -> Self {
        let mut keys = GroupKeys::default();
        for key in chunk_keys {
            match key.as_ref().trim() {
                "" => {}
                KEY_TIME => keys.time = true,
                KEY_TAG => keys.tag = true,
                field => keys.fields.push(field.to_string()),
            }
        }
        keys
    }

    pub fn uses_time(&self) -> bool {
        self.time
    }

    pub fn uses_tag(&self) -> bool {
        self.tag
    }

    pub fn variable_fields(&self) -> &[String] {
        &self.fields
    }

    /// Compute the metadata key for one record.
    ///
    /// `timekey_range_secs` must be provided when the time component is
    /// active; configuration validation guarantees this before the engine
    /// starts.
    pub fn key_for(
        &self,
        tag: &str,
        event_time: DateTime<Utc>,
        record: &Record,
        timekey_range_secs: Option<i64>,
    ) -> MetadataKey {
        let timekey = if self.time {
            let range = timekey_range_secs
                .expect("timekey_range must be validated before keys are computed");
            Some(timekey_for(event_time.timestamp(), range))
        } else {
            None
        };

        let tag = self.tag.then(|| tag.to_string());

        let variables = if self.fields.is_empty() {
            None
        } else {
            Some(
                self.fields
                    .iter()
                    .map(|field| record.get(field).map(variable_value))
                    .collect(),
            )
        };

        MetadataKey {
            timekey,
            tag,
            variables,
        }
    }
}

/// Render a record field value as a grouping variable.
fn variable_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
