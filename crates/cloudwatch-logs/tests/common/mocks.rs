// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory log service with the remote's token and pagination rules.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use cloudwatch_logs::client::{
    EventsPage, GetEventsRequest, GroupsPage, LogsClient, RemoteStream, StreamsPage,
};
use cloudwatch_logs::store::{MemoryStore, StateStore};
use cloudwatch_logs::{FetchedEvent, PendingRecord, RemoteError, StoreError, StreamKey};

#[derive(Debug, Default)]
struct StreamData {
    token: Option<String>,
    events: Vec<FetchedEvent>,
}

#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct PutAttempt {
    pub key: StreamKey,
    pub token: Option<String>,
    pub timestamps: Vec<i64>,
}

#[derive(Debug, Default)]
struct ServiceState {
    groups: BTreeMap<String, BTreeMap<String, StreamData>>,
    next_sequence: u64,
    page_size: Option<usize>,
    put_failures: VecDeque<RemoteError>,
    puts: Vec<PutAttempt>,
    list_stream_calls: usize,
    get_event_calls: usize,
}

impl ServiceState {
    fn next_token(&mut self) -> String {
        self.next_sequence += 1;
        format!("{:020}", self.next_sequence)
    }
}

/// Sequence tokens advance on every accepted write, and a write presenting
/// a stale token is rejected with the token the service expected.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLogs {
    state: Arc<Mutex<ServiceState>>,
}

#[allow(dead_code)]
impl SimulatedLogs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }

    /// Listing and fetch calls return at most `size` items per page.
    pub fn set_page_size(&self, size: usize) {
        self.state().page_size = Some(size);
    }

    pub fn create_group(&self, group: &str) {
        self.state().groups.entry(group.to_string()).or_default();
    }

    pub fn create_stream(&self, key: &StreamKey) {
        self.state()
            .groups
            .entry(key.group.clone())
            .or_default()
            .entry(key.stream.clone())
            .or_default();
    }

    /// Events written by someone else, with ingestion one second later.
    pub fn seed_events(&self, key: &StreamKey, events: &[(i64, &str)]) {
        let mut state = self.state();
        let stream = state
            .groups
            .entry(key.group.clone())
            .or_default()
            .entry(key.stream.clone())
            .or_default();
        stream
            .events
            .extend(events.iter().map(|(timestamp, message)| FetchedEvent {
                timestamp: *timestamp,
                ingestion_time: timestamp + 1000,
                message: (*message).to_string(),
            }));
    }

    /// Simulates a concurrent writer advancing the stream's token.
    pub fn write_elsewhere(&self, key: &StreamKey) {
        let mut state = self.state();
        let token = state.next_token();
        if let Some(stream) = state
            .groups
            .get_mut(&key.group)
            .and_then(|streams| streams.get_mut(&key.stream))
        {
            stream.token = Some(token);
        }
    }

    pub fn delete_stream(&self, key: &StreamKey) {
        if let Some(streams) = self.state().groups.get_mut(&key.group) {
            streams.remove(&key.stream);
        }
    }

    /// Failures returned by the next puts, before any token check.
    pub fn fail_puts(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.state().put_failures.extend(errors);
    }

    pub fn token(&self, key: &StreamKey) -> Option<String> {
        self.state()
            .groups
            .get(&key.group)
            .and_then(|streams| streams.get(&key.stream))
            .and_then(|stream| stream.token.clone())
    }

    pub fn messages(&self, key: &StreamKey) -> Vec<String> {
        self.state()
            .groups
            .get(&key.group)
            .and_then(|streams| streams.get(&key.stream))
            .map(|stream| stream.events.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    pub fn puts(&self) -> Vec<PutAttempt> {
        self.state().puts.clone()
    }

    pub fn list_stream_calls(&self) -> usize {
        self.state().list_stream_calls
    }

    pub fn get_event_calls(&self) -> usize {
        self.state().get_event_calls
    }
}

fn page<T: Clone>(items: &[T], offset: usize, size: Option<usize>) -> (Vec<T>, Option<String>) {
    let end = size.map_or(items.len(), |size| (offset + size).min(items.len()));
    let next = (end < items.len()).then(|| end.to_string());
    (items[offset.min(end)..end].to_vec(), next)
}

fn offset(token: Option<&str>) -> usize {
    token.and_then(|t| t.parse().ok()).unwrap_or(0)
}

fn group_missing() -> RemoteError {
    RemoteError::GroupMissing("The specified log group does not exist.".to_string())
}

fn stream_missing() -> RemoteError {
    RemoteError::StreamMissing("The specified log stream does not exist.".to_string())
}

#[async_trait]
impl LogsClient for SimulatedLogs {
    async fn list_groups(
        &self,
        prefix: &str,
        next_token: Option<&str>,
    ) -> Result<GroupsPage, RemoteError> {
        let state = self.state();
        let names: Vec<String> = state
            .groups
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        let (groups, next_token) = page(&names, offset(next_token), state.page_size);
        Ok(GroupsPage { groups, next_token })
    }

    async fn list_streams(
        &self,
        group: &str,
        prefix: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<StreamsPage, RemoteError> {
        let mut state = self.state();
        state.list_stream_calls += 1;
        let streams: Vec<RemoteStream> = state
            .groups
            .get(group)
            .ok_or_else(group_missing)?
            .iter()
            .filter(|(name, _)| prefix.map_or(true, |p| name.starts_with(p)))
            .map(|(name, data)| RemoteStream {
                name: name.clone(),
                upload_sequence_token: data.token.clone(),
            })
            .collect();
        let (streams, next_token) = page(&streams, offset(next_token), state.page_size);
        Ok(StreamsPage {
            streams,
            next_token,
        })
    }

    /// The forward token is the offset of the next unread event. At the end
    /// of the stream the presented token comes back unchanged.
    async fn get_events(&self, request: &GetEventsRequest) -> Result<EventsPage, RemoteError> {
        let mut state = self.state();
        state.get_event_calls += 1;
        let page_size = state.page_size;
        let stream = state
            .groups
            .get(&request.key.group)
            .ok_or_else(group_missing)?
            .get(&request.key.stream)
            .ok_or_else(stream_missing)?;

        let start = offset(request.next_token.as_deref());
        let matching: Vec<FetchedEvent> = stream
            .events
            .iter()
            .skip(start)
            .take(page_size.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        let read = matching.len();
        let events = matching
            .into_iter()
            .filter(|e| request.start_time.map_or(true, |t| e.timestamp >= t))
            .filter(|e| request.end_time.map_or(true, |t| e.timestamp <= t))
            .collect();
        Ok(EventsPage {
            events,
            next_forward_token: Some((start + read).to_string()),
        })
    }

    async fn put_events(
        &self,
        key: &StreamKey,
        sequence_token: Option<&str>,
        records: &[PendingRecord],
    ) -> Result<Option<String>, RemoteError> {
        let mut state = self.state();
        state.puts.push(PutAttempt {
            key: key.clone(),
            token: sequence_token.map(String::from),
            timestamps: records.iter().map(|r| r.timestamp).collect(),
        });
        if let Some(err) = state.put_failures.pop_front() {
            return Err(err);
        }

        let next = state.next_token();
        let stream = state
            .groups
            .get_mut(&key.group)
            .ok_or_else(group_missing)?
            .get_mut(&key.stream)
            .ok_or_else(stream_missing)?;
        if stream.token.as_deref() != sequence_token {
            return Err(RemoteError::TokenConflict {
                expected: stream.token.clone(),
                message: "The given sequenceToken is invalid.".to_string(),
            });
        }

        stream.events.extend(records.iter().map(|r| FetchedEvent {
            timestamp: r.timestamp,
            ingestion_time: r.timestamp,
            message: String::from_utf8_lossy(&r.payload).into_owned(),
        }));
        stream.token = Some(next.clone());
        Ok(Some(next))
    }

    async fn create_group(
        &self,
        group: &str,
        _tags: Option<&HashMap<String, String>>,
    ) -> Result<(), RemoteError> {
        let mut state = self.state();
        if state.groups.contains_key(group) {
            return Err(RemoteError::AlreadyExists(format!(
                "The specified log group already exists: {group}"
            )));
        }
        state.groups.insert(group.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn create_stream(&self, key: &StreamKey) -> Result<(), RemoteError> {
        let mut state = self.state();
        let streams = state.groups.get_mut(&key.group).ok_or_else(group_missing)?;
        if streams.contains_key(&key.stream) {
            return Err(RemoteError::AlreadyExists(format!(
                "The specified log stream already exists: {}",
                key.stream
            )));
        }
        streams.insert(key.stream.clone(), StreamData::default());
        Ok(())
    }

    async fn set_retention(&self, group: &str, _days: u32) -> Result<(), RemoteError> {
        if self.state().groups.contains_key(group) {
            Ok(())
        } else {
            Err(group_missing())
        }
    }
}

/// Memory store counting writes.
#[derive(Debug, Default)]
pub struct CountingStore {
    inner: MemoryStore,
    writes: Mutex<Vec<(String, String)>>,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

impl StateStore for CountingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        self.inner.put(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key)
    }
}
