// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Moves structured log records between a local pipeline and a remote,
//! append-only log service organised as `(group, stream)` pairs.
//!
//! Ingestion side: [`resolver`] expands configured names into concrete
//! streams, [`poller`] fetches pages per stream and remembers a cursor in
//! [`store`]. Egress side: [`format`] turns records into pending events,
//! [`buffer`] queues them, [`dispatcher`] groups them per destination and
//! hands [`batch`]es to the [`commit`] engine, which keeps the per-stream
//! write token in [`sequence`] and creates missing resources through
//! [`provisioner`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod buffer;
pub mod client;
pub mod clock;
pub mod commit;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod format;
pub mod http;
pub mod model;
pub mod parser;
pub mod poller;
pub mod provisioner;
pub mod resolver;
pub mod sequence;
pub mod sink;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use client::LogsClient;
pub use errors::{ConfigError, ParseError, PollError, RemoteError, StoreError};
pub use model::{Batch, FetchedEvent, PendingRecord, StreamDescriptor, StreamKey};
