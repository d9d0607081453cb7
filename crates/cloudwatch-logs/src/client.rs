// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capability contract of the remote log service, plus the lookups and
//! throttling retry shared by the components built on top of it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::clock::Clock;
use crate::errors::RemoteError;
use crate::model::{FetchedEvent, PendingRecord, StreamKey};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupsPage {
    pub groups: Vec<String>,
    pub next_token: Option<String>,
}

/// A stream as reported by the listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub name: String,
    /// Token required by the next append; absent for streams never written.
    pub upload_sequence_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamsPage {
    pub streams: Vec<RemoteStream>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetEventsRequest {
    pub key: StreamKey,
    pub next_token: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub start_from_head: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventsPage {
    pub events: Vec<FetchedEvent>,
    pub next_forward_token: Option<String>,
}

/// Operations the forwarder needs from the remote log service.
///
/// Implementations classify every failure into a [`RemoteError`] variant;
/// callers never inspect raw service error codes.
#[async_trait]
pub trait LogsClient: Send + Sync {
    async fn list_groups(
        &self,
        prefix: &str,
        next_token: Option<&str>,
    ) -> Result<GroupsPage, RemoteError>;

    async fn list_streams(
        &self,
        group: &str,
        prefix: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<StreamsPage, RemoteError>;

    async fn get_events(&self, request: &GetEventsRequest) -> Result<EventsPage, RemoteError>;

    /// Appends `records` and returns the token for the next append.
    async fn put_events(
        &self,
        key: &StreamKey,
        sequence_token: Option<&str>,
        records: &[PendingRecord],
    ) -> Result<Option<String>, RemoteError>;

    async fn create_group(
        &self,
        group: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<(), RemoteError>;

    async fn create_stream(&self, key: &StreamKey) -> Result<(), RemoteError>;

    async fn set_retention(&self, group: &str, days: u32) -> Result<(), RemoteError>;
}

/// Sleep-and-retry policy for throttled listing and fetch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleBackoff {
    pub wait: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl ThrottleBackoff {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            max_retries: None,
        }
    }
}

/// Runs `call`, sleeping `backoff.wait` and retrying the same call while the
/// service reports throttling. Without a backoff the throttling error is
/// returned as is.
pub async fn call_with_throttle_retry<T, F, Fut>(
    clock: &dyn Clock,
    backoff: Option<ThrottleBackoff>,
    operation: &str,
    mut call: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut retries: u32 = 0;
    loop {
        match call().await {
            Err(err) if err.is_throttling() => {
                let Some(backoff) = backoff else {
                    return Err(err);
                };
                if backoff.max_retries.is_some_and(|max| retries >= max) {
                    return Err(err);
                }
                retries += 1;
                warn!(
                    operation,
                    attempt = retries,
                    wait_ms = backoff.wait.as_millis() as u64,
                    "{operation} throttled, retrying"
                );
                clock.sleep(backoff.wait).await;
            }
            other => return other,
        }
    }
}

/// Checks whether a group named exactly `group` exists.
///
/// The service only supports prefix listing, so every page is scanned.
pub async fn group_exists(client: &dyn LogsClient, group: &str) -> Result<bool, RemoteError> {
    let mut next_token: Option<String> = None;
    loop {
        let page = client.list_groups(group, next_token.as_deref()).await?;
        if page.groups.iter().any(|name| name == group) {
            return Ok(true);
        }
        match page.next_token {
            Some(token) => next_token = Some(token),
            None => return Ok(false),
        }
    }
}

/// Finds the stream named exactly `key.stream` in `key.group`.
///
/// A missing group is reported as [`RemoteError::GroupMissing`], a missing
/// stream as `Ok(None)`.
pub async fn find_stream(
    client: &dyn LogsClient,
    key: &StreamKey,
) -> Result<Option<RemoteStream>, RemoteError> {
    let mut next_token: Option<String> = None;
    loop {
        let page = client
            .list_streams(&key.group, Some(&key.stream), next_token.as_deref())
            .await?;
        if let Some(stream) = page.streams.into_iter().find(|s| s.name == key.stream) {
            return Ok(Some(stream));
        }
        match page.next_token {
            Some(token) => next_token = Some(token),
            None => return Ok(None),
        }
    }
}
