//! The merged event emitted once a logical record is complete.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Tag applied when a flush was forced by the `max_lines` bound.
pub const MAX_LINES_TAG: &str = "multiline_codec_max_lines_reached";

/// Tag applied when a flush was forced by the `max_bytes` bound.
pub const MAX_BYTES_TAG: &str = "multiline_codec_max_bytes_reached";

/// A logical record produced by joining one or more physical lines.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedEvent {
    /// When the record was assembled.
    pub timestamp: DateTime<Utc>,
    /// The buffered lines joined with the configured delimiter.
    pub message: String,
    /// Tags describing how the record came to be (multiline, bound-triggered).
    pub tags: BTreeSet<String>,
    /// Sequencer output as `(field name, value)`, when the sequencer is enabled.
    pub sequence: Option<(String, i64)>,
    /// Provenance of the record. Stamped by the emission context, not the
    /// assembler itself.
    pub path: Option<String>,
}

impl MergedEvent {
    /// Creates an event carrying `message`, stamped with the current time.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            tags: BTreeSet::new(),
            sequence: None,
            path: None,
        }
    }

    /// Whether the event carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

// The wire shape is a flat map: the sequencer value appears under its
// configured field name, and empty/absent members are omitted entirely.
impl Serialize for MergedEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut len = 2;
        if !self.tags.is_empty() {
            len += 1;
        }
        if self.sequence.is_some() {
            len += 1;
        }
        if self.path.is_some() {
            len += 1;
        }

        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("message", &self.message)?;
        if !self.tags.is_empty() {
            map.serialize_entry("tags", &self.tags)?;
        }
        if let Some((field, value)) = &self.sequence {
            map.serialize_entry(field, value)?;
        }
        if let Some(path) = &self.path {
            map.serialize_entry("path", path)?;
        }
        map.end()
    }
}
