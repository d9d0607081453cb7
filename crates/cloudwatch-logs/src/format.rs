// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns outbound records into a destination and an encoded event.

use chrono::{DateTime, Local, Utc};
use serde_json::Value;
use tracing::warn;

use crate::model::{PendingRecord, StreamKey};
use crate::parser::Record;

const UTC_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// Where the group or stream name of a record comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationSource {
    Fixed(String),
    Tag,
    /// Read from a record field, optionally removing it from the payload.
    RecordKey { key: String, remove: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConfig {
    pub group: DestinationSource,
    pub stream: DestinationSource,
    /// Adds the event time to the payload under `time_key`.
    pub include_time_key: bool,
    pub time_key: String,
    pub localtime: bool,
    /// When set, the payload is these fields' values joined by a space
    /// instead of the whole record as JSON.
    pub message_keys: Vec<String>,
    pub max_message_length: Option<usize>,
}

impl FormatConfig {
    pub fn new(group: DestinationSource, stream: DestinationSource) -> Self {
        Self {
            group,
            stream,
            include_time_key: false,
            time_key: "time".to_string(),
            localtime: false,
            message_keys: Vec::new(),
            max_message_length: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordFormatter {
    config: FormatConfig,
}

impl RecordFormatter {
    pub fn new(config: FormatConfig) -> Self {
        Self { config }
    }

    /// `None` when the record does not name its destination or formats to an
    /// empty message, which the service rejects.
    pub fn format(&self, tag: &str, time_ms: i64, mut record: Record) -> Option<(StreamKey, PendingRecord)> {
        let group = resolve_destination(&self.config.group, tag, &mut record)?;
        let stream = resolve_destination(&self.config.stream, tag, &mut record)?;

        if self.config.include_time_key {
            if let Some(time) = self.format_time(time_ms) {
                record.insert(self.config.time_key.clone(), Value::String(time));
            }
        }

        let mut message = if self.config.message_keys.is_empty() {
            Value::Object(record).to_string()
        } else {
            self.config
                .message_keys
                .iter()
                .filter_map(|key| record.get(key))
                .map(|value| match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        };

        if let Some(max) = self.config.max_message_length {
            truncate_at_char_boundary(&mut message, max);
        }
        if message.is_empty() {
            warn!(tag, group = %group, stream = %stream, "formatted message is empty, skipping");
            return None;
        }

        Some((
            StreamKey::new(group, stream),
            PendingRecord::new(time_ms, message),
        ))
    }

    fn format_time(&self, time_ms: i64) -> Option<String> {
        let time = DateTime::<Utc>::from_timestamp_millis(time_ms)?;
        Some(if self.config.localtime {
            time.with_timezone(&Local).format(LOCAL_TIME_FORMAT).to_string()
        } else {
            time.format(UTC_TIME_FORMAT).to_string()
        })
    }
}

fn resolve_destination(source: &DestinationSource, tag: &str, record: &mut Record) -> Option<String> {
    match source {
        DestinationSource::Fixed(name) => Some(name.clone()),
        DestinationSource::Tag => Some(tag.to_string()),
        DestinationSource::RecordKey { key, remove } => {
            let value = if *remove {
                record.remove(key)
            } else {
                record.get(key).cloned()
            };
            match value {
                Some(Value::String(name)) if !name.is_empty() => Some(name),
                Some(Value::Null) | None => {
                    warn!(tag, field = %key, "record has no '{key}' field, skipping");
                    None
                }
                Some(Value::String(_)) => {
                    warn!(tag, field = %key, "record field '{key}' is empty, skipping");
                    None
                }
                Some(other) => Some(other.to_string()),
            }
        }
    }
}

fn truncate_at_char_boundary(message: &mut String, max: usize) {
    if message.len() <= max {
        return;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}
