// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and defaults of the remote log service.
//!
//! The append call rejects requests that break any of these limits, so the
//! batch builder enforces them before anything is sent.

use std::time::Duration;

/// Fixed per-event overhead the service adds to each message when computing
/// the request size.
pub const EVENT_HEADER_SIZE: usize = 26;

/// Maximum size of a single event (message bytes plus [`EVENT_HEADER_SIZE`]).
///
/// Events above this size are discarded, never truncated.
pub const MAX_EVENT_SIZE: usize = 256 * 1_024;

/// Maximum size of one append request, summed over its events.
pub const MAX_BATCH_SIZE: usize = 1_024 * 1_024;

/// Maximum number of events in one append request.
pub const MAX_EVENT_COUNT: usize = 10_000;

/// Events in one append request must span less than this.
pub const MAX_BATCH_SPAN: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between two ingestion cycles.
pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(60);

/// Default base wait of the throttling backoff on the append path.
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);

/// Default number of throttling retries before a batch is dropped.
pub const DEFAULT_RETRY_LIMIT: u32 = 17;

/// Pause before re-reading the upload token after a token conflict.
pub const TOKEN_RESYNC_PAUSE: Duration = Duration::from_secs(1);

/// Default number of destinations committed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default queue capacity of the pending-record buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 50_000;
