// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic ingestion from remote streams.
//!
//! Every tick the poller resolves the streams to read, fetches one page per
//! stream starting at the stored cursor, hands the decoded records to the
//! sink and stores the new forward token. The service answers "nothing new"
//! by returning the token it was given, so the cursor is only written when
//! the token changes.
//!
//! Records are emitted before the cursor moves: a crash between the two
//! replays the page instead of losing it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{call_with_throttle_retry, GetEventsRequest, LogsClient, ThrottleBackoff};
use crate::clock::Clock;
use crate::constants;
use crate::errors::PollError;
use crate::model::{FetchedEvent, StreamDescriptor, StreamKey};
use crate::parser::{Record, RecordParser};
use crate::resolver::StreamResolver;
use crate::sink::{ErrorSink, RecordSink};
use crate::store::CursorStore;

/// Which remote time becomes the record time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoteTime {
    /// Time the writer attached to the event.
    #[default]
    Timestamp,
    /// Time the service received the event.
    IngestionTime,
}

/// Fields added to every ingested record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    pub group_key: Option<String>,
    pub stream_key: Option<String>,
    /// Adds a `metadata` object with the group, stream and ingestion time.
    pub include_metadata: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    pub tag: String,
    pub fetch_interval: Duration,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Ignore times parsed from the message and use the remote time.
    pub use_remote_timestamp: bool,
    pub remote_time: RemoteTime,
    pub enrichment: Enrichment,
    pub throttle_backoff: Option<ThrottleBackoff>,
}

impl PollerConfig {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            fetch_interval: constants::DEFAULT_FETCH_INTERVAL,
            start_time: None,
            end_time: None,
            use_remote_timestamp: false,
            remote_time: RemoteTime::default(),
            enrichment: Enrichment::default(),
            throttle_backoff: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Fetching,
    Emitting,
    Stopped,
}

/// Counters of one ingestion cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub streams: usize,
    pub events: usize,
    pub decode_errors: usize,
    pub failed_streams: usize,
}

pub struct IngestionPoller {
    client: Arc<dyn LogsClient>,
    clock: Arc<dyn Clock>,
    resolver: StreamResolver,
    cursors: CursorStore,
    parser: Arc<dyn RecordParser>,
    sink: Arc<dyn RecordSink>,
    error_sink: Arc<dyn ErrorSink>,
    config: PollerConfig,
    state: PollerState,
    static_streams: Option<Vec<StreamDescriptor>>,
}

impl IngestionPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn LogsClient>,
        clock: Arc<dyn Clock>,
        resolver: StreamResolver,
        cursors: CursorStore,
        parser: Arc<dyn RecordParser>,
        sink: Arc<dyn RecordSink>,
        error_sink: Arc<dyn ErrorSink>,
        config: PollerConfig,
    ) -> Self {
        Self {
            client,
            clock,
            resolver,
            cursors,
            parser,
            sink,
            error_sink,
            config,
            state: PollerState::Idle,
            static_streams: None,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    /// Runs one cycle over every resolved stream. Errors are logged, never
    /// returned: a failing stream does not stop the others.
    pub async fn poll_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let streams = match self.streams().await {
            Ok(streams) => streams,
            Err(err) => {
                error!(error = %err, "failed to resolve log streams, skipping cycle");
                return report;
            }
        };

        for descriptor in &streams {
            report.streams += 1;
            match self.poll_stream(&descriptor.key).await {
                Ok((events, decode_errors)) => {
                    report.events += events;
                    report.decode_errors += decode_errors;
                }
                Err(err) => {
                    report.failed_streams += 1;
                    error!(
                        group = %descriptor.key.group,
                        stream = %descriptor.key.stream,
                        error = %err,
                        "failed to fetch log events"
                    );
                }
            }
            self.state = PollerState::Idle;
        }
        report
    }

    /// Polls every `fetch_interval` until `cancel` fires. A cycle in
    /// progress always completes.
    pub async fn run(mut self, cancel: CancellationToken) -> Self {
        info!(tag = %self.config.tag, "ingestion poller started");
        let interval_ms = i64::try_from(self.config.fetch_interval.as_millis()).unwrap_or(i64::MAX);
        let mut next_tick = self.clock.now_millis();

        while !cancel.is_cancelled() {
            let report = self.poll_once().await;
            debug!(
                streams = report.streams,
                events = report.events,
                failed = report.failed_streams,
                "ingestion cycle finished"
            );

            next_tick = next_tick.saturating_add(interval_ms);
            let wait_ms = next_tick.saturating_sub(self.clock.now_millis()).max(0);
            let wait = Duration::from_millis(u64::try_from(wait_ms).unwrap_or_default());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.clock.sleep(wait) => {}
            }
        }

        self.state = PollerState::Stopped;
        info!(tag = %self.config.tag, "ingestion poller stopped");
        self
    }

    /// Starts [`Self::run`] on its own task.
    pub fn spawn(self) -> PollerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        PollerHandle { cancel, task }
    }

    async fn streams(&mut self) -> Result<Vec<StreamDescriptor>, PollError> {
        if let Some(streams) = &self.static_streams {
            return Ok(streams.clone());
        }
        let streams = self.resolver.resolve().await?;
        if !self.resolver.is_dynamic() {
            self.static_streams = Some(streams.clone());
        }
        Ok(streams)
    }

    async fn poll_stream(&mut self, key: &StreamKey) -> Result<(usize, usize), PollError> {
        self.state = PollerState::Fetching;
        let token = self.cursors.get(key)?;
        let request = GetEventsRequest {
            key: key.clone(),
            next_token: token.clone(),
            start_time: self.config.start_time,
            end_time: self.config.end_time,
            start_from_head: self.config.start_time.is_some() || self.config.end_time.is_some(),
        };
        debug!(group = %key.group, stream = %key.stream, token = ?token, "Calling GetLogEvents API");
        let page = call_with_throttle_retry(
            self.clock.as_ref(),
            self.config.throttle_backoff,
            "GetLogEvents",
            || self.client.get_events(&request),
        )
        .await?;

        self.state = PollerState::Emitting;
        let events = page.events.len();
        let mut decode_errors = 0;
        for event in &page.events {
            if !self.emit_event(key, event) {
                decode_errors += 1;
            }
        }

        if let Some(next) = page.next_forward_token {
            if token.as_deref() != Some(next.as_str()) {
                self.cursors.put(key, &next)?;
            }
        }
        Ok((events, decode_errors))
    }

    /// Returns `false` when the message could not be decoded.
    fn emit_event(&self, key: &StreamKey, event: &FetchedEvent) -> bool {
        let remote_time = match self.config.remote_time {
            RemoteTime::Timestamp => event.timestamp,
            RemoteTime::IngestionTime => event.ingestion_time,
        };

        let parsed = match self.parser.parse(&event.message) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    group = %key.group,
                    stream = %key.stream,
                    error = %err,
                    "failed to decode log event"
                );
                let mut record = Record::new();
                record.insert("message".to_string(), Value::String(event.message.clone()));
                self.enrich(&mut record, key, event);
                self.error_sink
                    .emit_error(&self.config.tag, remote_time, record, &err.to_string());
                return false;
            }
        };

        for mut parsed in parsed {
            self.enrich(&mut parsed.record, key, event);
            let time = match parsed.time {
                Some(time) if !self.config.use_remote_timestamp => time,
                _ => remote_time,
            };
            self.sink.emit(&self.config.tag, time, parsed.record);
        }
        true
    }

    fn enrich(&self, record: &mut Record, key: &StreamKey, event: &FetchedEvent) {
        let enrichment = &self.config.enrichment;
        if let Some(field) = &enrichment.group_key {
            record.insert(field.clone(), Value::String(key.group.clone()));
        }
        if let Some(field) = &enrichment.stream_key {
            record.insert(field.clone(), Value::String(key.stream.clone()));
        }
        if enrichment.include_metadata {
            let mut metadata = Record::new();
            metadata.insert("ingestion_time".to_string(), event.ingestion_time.into());
            metadata.insert("log_group_name".to_string(), key.group.clone().into());
            metadata.insert("log_stream_name".to_string(), key.stream.clone().into());
            record.insert("metadata".to_string(), Value::Object(metadata));
        }
    }
}

/// Controls a poller running on its own task.
pub struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<IngestionPoller>,
}

impl PollerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops the loop after the cycle in progress and waits for the task.
    pub async fn shutdown(self) -> Option<IngestionPoller> {
        self.cancel.cancel();
        match self.task.await {
            Ok(poller) => Some(poller),
            Err(err) => {
                error!("ingestion poller task failed: {err}");
                None
            }
        }
    }
}
