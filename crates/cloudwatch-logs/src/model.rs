// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use derive_more::Display;

use crate::constants::EVENT_HEADER_SIZE;

/// Identifies one remote stream.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{group}/{stream}")]
pub struct StreamKey {
    pub group: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(group: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
        }
    }

    /// Flat storage key `<group>_<stream>`, with path separators replaced so
    /// the key is usable as a file name.
    pub fn state_key(&self) -> String {
        format!("{}_{}", self.group, self.stream).replace(['/', '\\'], "-")
    }
}

/// A stream to poll in the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub key: StreamKey,
    /// `true` when the stream came from prefix or date expansion rather
    /// than a literal name.
    pub discovered: bool,
}

/// An event returned by a fetch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedEvent {
    /// Event time assigned by the writer, in milliseconds since epoch.
    pub timestamp: i64,
    /// Time the service received the event, in milliseconds since epoch.
    pub ingestion_time: i64,
    pub message: String,
}

/// An encoded message waiting to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

impl PendingRecord {
    pub fn new(timestamp: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    /// Size counted against the request limits.
    pub fn size(&self) -> usize {
        self.payload.len() + EVENT_HEADER_SIZE
    }
}

/// Records for a single append call, in timestamp order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<PendingRecord>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_size(&self) -> usize {
        self.records.iter().map(PendingRecord::size).sum()
    }

    /// Milliseconds between the first and last record.
    pub fn span_millis(&self) -> i64 {
        match (self.records.first(), self.records.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0,
        }
    }
}
