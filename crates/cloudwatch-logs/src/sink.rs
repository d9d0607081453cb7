// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downstream receivers of ingested records.

use tokio::sync::mpsc;
use tracing::warn;

use crate::parser::Record;

pub trait RecordSink: Send + Sync {
    fn emit(&self, tag: &str, time_ms: i64, record: Record);
}

/// Receives messages that could not be decoded, with the cause.
pub trait ErrorSink: Send + Sync {
    fn emit_error(&self, tag: &str, time_ms: i64, record: Record, cause: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Record {
        tag: String,
        time_ms: i64,
        record: Record,
    },
    Error {
        tag: String,
        time_ms: i64,
        record: Record,
        cause: String,
    },
}

/// Forwards records and errors into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            warn!("record receiver dropped, discarding record");
        }
    }
}

impl RecordSink for ChannelSink {
    fn emit(&self, tag: &str, time_ms: i64, record: Record) {
        self.send(SinkEvent::Record {
            tag: tag.to_string(),
            time_ms,
            record,
        });
    }
}

impl ErrorSink for ChannelSink {
    fn emit_error(&self, tag: &str, time_ms: i64, record: Record, cause: &str) {
        self.send(SinkEvent::Error {
            tag: tag.to_string(),
            time_ms,
            record,
            cause: cause.to_string(),
        });
    }
}
