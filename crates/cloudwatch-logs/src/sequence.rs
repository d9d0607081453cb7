// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-stream upload tokens.
//!
//! The cache is filled lazily: the first reference to a group checks that it
//! exists, the first reference to a stream looks it up by name and keeps its
//! current upload token. Only positive results are kept; a missing group or
//! stream is looked up again on its next reference, so resources created
//! elsewhere are picked up. The maps are shared by all commit workers and
//! live behind one async mutex that is never held across a remote call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::client::{self, LogsClient};
use crate::errors::RemoteError;
use crate::model::StreamKey;

/// What is known about a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEntry {
    /// The stream exists; `None` means it was never appended to.
    Known(Option<String>),
    /// The lookup did not find the stream. Never cached.
    Missing,
}

#[derive(Debug, Default)]
struct CacheState {
    groups: HashSet<String>,
    streams: HashMap<StreamKey, Option<String>>,
}

pub struct SequenceTokenCache {
    client: Arc<dyn LogsClient>,
    state: Mutex<CacheState>,
}

impl SequenceTokenCache {
    pub fn new(client: Arc<dyn LogsClient>) -> Self {
        Self {
            client,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached token, without remote lookup.
    pub async fn get(&self, key: &StreamKey) -> Option<String> {
        self.state.lock().await.streams.get(key).cloned().flatten()
    }

    pub async fn set(&self, key: &StreamKey, token: Option<String>) {
        self.state
            .lock()
            .await
            .streams
            .insert(key.clone(), token);
    }

    /// Drops everything cached for `key`; the next reference looks it up again.
    pub async fn forget(&self, key: &StreamKey) {
        self.state.lock().await.streams.remove(key);
    }

    /// Whether `group` exists. Checked remotely until it is seen to exist.
    pub async fn group_exists(&self, group: &str) -> Result<bool, RemoteError> {
        if self.state.lock().await.groups.contains(group) {
            return Ok(true);
        }
        let exists = client::group_exists(self.client.as_ref(), group).await?;
        debug!(group, exists, "checked log group");
        if exists {
            self.state.lock().await.groups.insert(group.to_string());
        }
        Ok(exists)
    }

    /// Cached entry for `key`, looked up remotely until the stream is found.
    pub async fn lookup_stream(&self, key: &StreamKey) -> Result<StreamEntry, RemoteError> {
        if let Some(token) = self.state.lock().await.streams.get(key) {
            return Ok(StreamEntry::Known(token.clone()));
        }
        self.refresh_token(key).await
    }

    /// Looks the stream up remotely and overwrites the cached entry.
    pub async fn refresh_token(&self, key: &StreamKey) -> Result<StreamEntry, RemoteError> {
        let found = client::find_stream(self.client.as_ref(), key).await;
        let mut state = self.state.lock().await;
        match found {
            Ok(Some(stream)) => {
                let token = stream.upload_sequence_token;
                debug!(group = %key.group, stream = %key.stream, token = ?token, "refreshed sequence token");
                state.groups.insert(key.group.clone());
                state.streams.insert(key.clone(), token.clone());
                Ok(StreamEntry::Known(token))
            }
            Ok(None) => {
                debug!(group = %key.group, stream = %key.stream, "log stream not found");
                state.streams.remove(key);
                Ok(StreamEntry::Missing)
            }
            Err(err @ RemoteError::GroupMissing(_)) => {
                state.groups.remove(&key.group);
                state.streams.remove(key);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn mark_group_exists(&self, group: &str) {
        self.state.lock().await.groups.insert(group.to_string());
    }

    /// Records a freshly created stream, which has no token yet.
    pub async fn mark_stream_created(&self, key: &StreamKey) {
        let mut state = self.state.lock().await;
        state.groups.insert(key.group.clone());
        state.streams.insert(key.clone(), None);
    }
}
