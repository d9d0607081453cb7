// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Splits pending records for one stream into append-sized batches.
//!
//! # Batching Strategy
//!
//! Records are sorted by timestamp first (stable, so records sharing a
//! timestamp keep their arrival order), then accumulated greedily. The
//! current batch is closed before adding a record when one of three limits
//! would be crossed:
//! 1. **Size limit**: summed record sizes, header included (1 MiB)
//! 2. **Count limit**: number of records (10,000)
//! 3. **Span limit**: `record.timestamp - first.timestamp` reaching 24 hours
//!
//! # Oversized Records
//!
//! A record larger than the per-record maximum (256 KiB, or the batch limit
//! when that is smaller) can never be sent. It is dropped with a warning
//! and never starts or joins a batch.

use std::time::Duration;

use tracing::warn;

use crate::constants;
use crate::model::{Batch, PendingRecord};

/// Ceilings applied by [`build_batches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_batch_size: usize,
    pub max_event_size: usize,
    pub max_event_count: usize,
    pub max_span: Duration,
}

impl Default for BatchLimits {
    /// Limits enforced by the remote append call.
    fn default() -> Self {
        Self {
            max_batch_size: constants::MAX_BATCH_SIZE,
            max_event_size: constants::MAX_EVENT_SIZE,
            max_event_count: constants::MAX_EVENT_COUNT,
            max_span: constants::MAX_BATCH_SPAN,
        }
    }
}

impl BatchLimits {
    /// Largest record that fits in a batch on its own.
    pub fn max_record_size(&self) -> usize {
        self.max_event_size.min(self.max_batch_size)
    }

    fn max_span_millis(&self) -> i64 {
        i64::try_from(self.max_span.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Groups `records` into batches honoring `limits`.
///
/// The output preserves timestamp order across and within batches.
pub fn build_batches(mut records: Vec<PendingRecord>, limits: &BatchLimits) -> Vec<Batch> {
    records.sort_by_key(|record| record.timestamp);

    let max_record_size = limits.max_record_size();
    let max_span = limits.max_span_millis();

    let mut batches = Vec::new();
    let mut current = Batch::default();
    let mut current_size = 0usize;

    for record in records {
        let size = record.size();
        if size > max_record_size {
            warn!(
                "Log event is discarded because it is too large: {} bytes exceeds limit of {}",
                size, max_record_size
            );
            continue;
        }

        if let Some(first) = current.records.first() {
            let would_overflow = current_size + size > limits.max_batch_size
                || current.records.len() + 1 > limits.max_event_count
                || record.timestamp - first.timestamp >= max_span;
            if would_overflow {
                batches.push(std::mem::take(&mut current));
                current_size = 0;
            }
        }

        current_size += size;
        current.records.push(record);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
