// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of fetched messages into structured records.

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde_json::{Map, Value};

use crate::errors::ParseError;

/// A structured log record.
pub type Record = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Event time found in the message, in milliseconds since epoch.
    pub time: Option<i64>,
    pub record: Record,
}

/// Turns one raw message into zero or more records.
pub trait RecordParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Vec<ParsedRecord>, ParseError>;
}

/// Extraction of an event time from a record field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeField {
    pub key: String,
    /// strftime pattern for string values. Numbers are read as epoch seconds.
    pub format: Option<String>,
    /// Leave the field in the record after reading it.
    pub keep: bool,
}

impl TimeField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            format: None,
            keep: false,
        }
    }

    fn extract(&self, record: &mut Record) -> Result<Option<i64>, ParseError> {
        let value = if self.keep {
            record.get(&self.key).cloned()
        } else {
            record.remove(&self.key)
        };
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(|secs| Some((secs * 1_000.0).round() as i64))
                .ok_or_else(|| ParseError::InvalidTime {
                    value: n.to_string(),
                    reason: "not representable".to_string(),
                }),
            Some(Value::String(s)) => parse_time(&s, self.format.as_deref()).map(Some),
            Some(other) => Err(ParseError::InvalidTime {
                value: other.to_string(),
                reason: "unsupported type".to_string(),
            }),
        }
    }
}

/// Parses `value` with `format`, or as RFC 3339 when no format is given.
/// Times without an offset are taken as UTC.
fn parse_time(value: &str, format: Option<&str>) -> Result<i64, ParseError> {
    let invalid = |reason: chrono::ParseError| ParseError::InvalidTime {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    match format {
        None => DateTime::parse_from_rfc3339(value)
            .map(|t| t.timestamp_millis())
            .map_err(invalid),
        Some(format) => match DateTime::parse_from_str(value, format) {
            Ok(t) => Ok(t.timestamp_millis()),
            Err(_) => NaiveDateTime::parse_from_str(value, format)
                .map(|t| t.and_utc().timestamp_millis())
                .map_err(invalid),
        },
    }
}

/// Messages holding a JSON object, or an array of objects.
#[derive(Debug, Clone, Default)]
pub struct JsonParser {
    pub time_field: Option<TimeField>,
}

impl JsonParser {
    fn to_parsed(&self, value: Value) -> Result<ParsedRecord, ParseError> {
        let mut record = match value {
            Value::Object(record) => record,
            other => return Err(ParseError::NotAnObject(json_type_name(&other))),
        };
        let time = match &self.time_field {
            Some(field) => field.extract(&mut record)?,
            None => None,
        };
        Ok(ParsedRecord { time, record })
    }
}

impl RecordParser for JsonParser {
    fn parse(&self, raw: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        match value {
            Value::Array(items) => items.into_iter().map(|v| self.to_parsed(v)).collect(),
            other => Ok(vec![self.to_parsed(other)?]),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Plain-text messages matched against a pattern with named captures.
/// Each named group that participates in the match becomes a string field.
#[derive(Debug, Clone)]
pub struct RegexParser {
    pattern: Regex,
    time_field: Option<TimeField>,
}

impl RegexParser {
    pub fn new(pattern: Regex, time_field: Option<TimeField>) -> Self {
        Self {
            pattern,
            time_field,
        }
    }
}

impl RecordParser for RegexParser {
    fn parse(&self, raw: &str) -> Result<Vec<ParsedRecord>, ParseError> {
        let captures = self.pattern.captures(raw).ok_or(ParseError::NoMatch)?;
        let mut record = Record::new();
        for name in self.pattern.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                record.insert(name.to_string(), Value::String(m.as_str().to_string()));
            }
        }
        let time = match &self.time_field {
            Some(field) => field.extract(&mut record)?,
            None => None,
        };
        Ok(vec![ParsedRecord { time, record }])
    }
}
