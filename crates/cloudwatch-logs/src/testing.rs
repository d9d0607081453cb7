// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted [`LogsClient`] shared by the component tests.
//!
//! Scripted responses are consumed in order; once a queue is empty the fake
//! falls back to a small in-memory model (registered groups and streams,
//! echoing fetch tokens, counting append tokens).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{EventsPage, GetEventsRequest, GroupsPage, LogsClient, RemoteStream, StreamsPage};
use crate::errors::RemoteError;
use crate::model::{FetchedEvent, PendingRecord, StreamKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PutCall {
    pub key: StreamKey,
    pub token: Option<String>,
    pub records: Vec<PendingRecord>,
}

#[derive(Debug, Default)]
struct FakeState {
    groups: Vec<String>,
    streams: HashMap<String, Vec<RemoteStream>>,
    group_pages: VecDeque<Result<GroupsPage, RemoteError>>,
    stream_pages: HashMap<String, VecDeque<Result<StreamsPage, RemoteError>>>,
    event_pages: HashMap<StreamKey, VecDeque<Result<EventsPage, RemoteError>>>,
    put_results: VecDeque<Result<Option<String>, RemoteError>>,
    create_group_results: VecDeque<Result<(), RemoteError>>,
    create_stream_results: VecDeque<Result<(), RemoteError>>,
    put_delay: Option<Duration>,

    list_group_calls: Vec<(String, Option<String>)>,
    list_stream_calls: Vec<(String, Option<String>, Option<String>)>,
    get_events_calls: Vec<GetEventsRequest>,
    put_calls: Vec<PutCall>,
    created_groups: Vec<(String, Option<HashMap<String, String>>)>,
    created_streams: Vec<StreamKey>,
    retention_calls: Vec<(String, u32)>,
    in_flight: HashMap<StreamKey, usize>,
    max_in_flight_per_key: usize,
    in_flight_total: usize,
    max_in_flight_total: usize,
}

#[derive(Debug, Default)]
pub(crate) struct FakeLogsClient {
    state: Mutex<FakeState>,
}

impl FakeLogsClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().expect("fake client state poisoned");
        f(&mut state)
    }

    pub fn add_group(&self, group: &str) {
        self.with_state(|s| {
            s.groups.push(group.to_string());
            s.streams.entry(group.to_string()).or_default();
        });
    }

    pub fn add_stream(&self, key: &StreamKey, token: Option<&str>) {
        self.with_state(|s| {
            if !s.groups.contains(&key.group) {
                s.groups.push(key.group.clone());
            }
            s.streams
                .entry(key.group.clone())
                .or_default()
                .push(RemoteStream {
                    name: key.stream.clone(),
                    upload_sequence_token: token.map(str::to_string),
                });
        });
    }

    pub fn add_group_page(&self, groups: Vec<&str>, next_token: Option<&str>) {
        self.with_state(|s| {
            s.group_pages.push_back(Ok(GroupsPage {
                groups: groups.into_iter().map(str::to_string).collect(),
                next_token: next_token.map(str::to_string),
            }))
        });
    }

    pub fn add_stream_page(
        &self,
        group: &str,
        streams: Vec<(&str, Option<&str>)>,
        next_token: Option<&str>,
    ) {
        let page = StreamsPage {
            streams: streams
                .into_iter()
                .map(|(name, token)| RemoteStream {
                    name: name.to_string(),
                    upload_sequence_token: token.map(str::to_string),
                })
                .collect(),
            next_token: next_token.map(str::to_string),
        };
        self.push_stream_result(group, Ok(page));
    }

    pub fn push_stream_result(&self, group: &str, result: Result<StreamsPage, RemoteError>) {
        self.with_state(|s| {
            s.stream_pages
                .entry(group.to_string())
                .or_default()
                .push_back(result)
        });
    }

    pub fn add_events_page(&self, key: &StreamKey, events: Vec<(i64, &str)>, next_token: &str) {
        let page = EventsPage {
            events: events
                .into_iter()
                .map(|(timestamp, message)| FetchedEvent {
                    timestamp,
                    ingestion_time: timestamp + 500,
                    message: message.to_string(),
                })
                .collect(),
            next_forward_token: Some(next_token.to_string()),
        };
        self.push_events_result(key, Ok(page));
    }

    pub fn push_events_result(&self, key: &StreamKey, result: Result<EventsPage, RemoteError>) {
        self.with_state(|s| {
            s.event_pages
                .entry(key.clone())
                .or_default()
                .push_back(result)
        });
    }

    pub fn push_put_result(&self, result: Result<Option<String>, RemoteError>) {
        self.with_state(|s| s.put_results.push_back(result));
    }

    pub fn push_create_group_result(&self, result: Result<(), RemoteError>) {
        self.with_state(|s| s.create_group_results.push_back(result));
    }

    pub fn push_create_stream_result(&self, result: Result<(), RemoteError>) {
        self.with_state(|s| s.create_stream_results.push_back(result));
    }

    pub fn set_put_delay(&self, delay: Duration) {
        self.with_state(|s| s.put_delay = Some(delay));
    }

    pub fn list_group_calls(&self) -> Vec<(String, Option<String>)> {
        self.with_state(|s| s.list_group_calls.clone())
    }

    pub fn list_stream_calls(&self) -> Vec<(String, Option<String>, Option<String>)> {
        self.with_state(|s| s.list_stream_calls.clone())
    }

    pub fn get_events_calls(&self) -> Vec<GetEventsRequest> {
        self.with_state(|s| s.get_events_calls.clone())
    }

    pub fn put_calls(&self) -> Vec<PutCall> {
        self.with_state(|s| s.put_calls.clone())
    }

    pub fn created_groups(&self) -> Vec<(String, Option<HashMap<String, String>>)> {
        self.with_state(|s| s.created_groups.clone())
    }

    pub fn created_streams(&self) -> Vec<StreamKey> {
        self.with_state(|s| s.created_streams.clone())
    }

    pub fn retention_calls(&self) -> Vec<(String, u32)> {
        self.with_state(|s| s.retention_calls.clone())
    }

    pub fn max_in_flight_per_key(&self) -> usize {
        self.with_state(|s| s.max_in_flight_per_key)
    }

    pub fn max_in_flight_total(&self) -> usize {
        self.with_state(|s| s.max_in_flight_total)
    }
}

#[async_trait]
impl LogsClient for FakeLogsClient {
    async fn list_groups(
        &self,
        prefix: &str,
        next_token: Option<&str>,
    ) -> Result<GroupsPage, RemoteError> {
        self.with_state(|s| {
            s.list_group_calls
                .push((prefix.to_string(), next_token.map(str::to_string)));
            if let Some(result) = s.group_pages.pop_front() {
                return result;
            }
            Ok(GroupsPage {
                groups: s
                    .groups
                    .iter()
                    .filter(|g| g.starts_with(prefix))
                    .cloned()
                    .collect(),
                next_token: None,
            })
        })
    }

    async fn list_streams(
        &self,
        group: &str,
        prefix: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<StreamsPage, RemoteError> {
        self.with_state(|s| {
            s.list_stream_calls.push((
                group.to_string(),
                prefix.map(str::to_string),
                next_token.map(str::to_string),
            ));
            if let Some(result) = s.stream_pages.get_mut(group).and_then(VecDeque::pop_front) {
                return result;
            }
            match s.streams.get(group) {
                Some(streams) => Ok(StreamsPage {
                    streams: streams
                        .iter()
                        .filter(|st| prefix.map_or(true, |p| st.name.starts_with(p)))
                        .cloned()
                        .collect(),
                    next_token: None,
                }),
                None => Err(RemoteError::GroupMissing(group.to_string())),
            }
        })
    }

    async fn get_events(&self, request: &GetEventsRequest) -> Result<EventsPage, RemoteError> {
        self.with_state(|s| {
            s.get_events_calls.push(request.clone());
            if let Some(result) = s
                .event_pages
                .get_mut(&request.key)
                .and_then(VecDeque::pop_front)
            {
                return result;
            }
            Ok(EventsPage {
                events: Vec::new(),
                next_forward_token: request.next_token.clone(),
            })
        })
    }

    async fn put_events(
        &self,
        key: &StreamKey,
        sequence_token: Option<&str>,
        records: &[PendingRecord],
    ) -> Result<Option<String>, RemoteError> {
        let delay = self.with_state(|s| {
            s.put_calls.push(PutCall {
                key: key.clone(),
                token: sequence_token.map(str::to_string),
                records: records.to_vec(),
            });
            let in_flight = s.in_flight.entry(key.clone()).or_default();
            *in_flight += 1;
            let per_key = *in_flight;
            s.max_in_flight_per_key = s.max_in_flight_per_key.max(per_key);
            s.in_flight_total += 1;
            s.max_in_flight_total = s.max_in_flight_total.max(s.in_flight_total);
            s.put_delay
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| {
            if let Some(in_flight) = s.in_flight.get_mut(key) {
                *in_flight -= 1;
            }
            s.in_flight_total -= 1;
            match s.put_results.pop_front() {
                Some(result) => result,
                None => Ok(Some(format!("token-{}", s.put_calls.len()))),
            }
        })
    }

    async fn create_group(
        &self,
        group: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<(), RemoteError> {
        self.with_state(|s| {
            s.created_groups.push((group.to_string(), tags.cloned()));
            let result = s.create_group_results.pop_front().unwrap_or(Ok(()));
            if result.is_ok() && !s.groups.iter().any(|g| g == group) {
                s.groups.push(group.to_string());
                s.streams.entry(group.to_string()).or_default();
            }
            result
        })
    }

    async fn create_stream(&self, key: &StreamKey) -> Result<(), RemoteError> {
        self.with_state(|s| {
            s.created_streams.push(key.clone());
            let result = s.create_stream_results.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                let streams = s.streams.entry(key.group.clone()).or_default();
                if !streams.iter().any(|st| st.name == key.stream) {
                    streams.push(RemoteStream {
                        name: key.stream.clone(),
                        upload_sequence_token: None,
                    });
                }
            }
            result
        })
    }

    async fn set_retention(&self, group: &str, days: u32) -> Result<(), RemoteError> {
        self.with_state(|s| s.retention_calls.push((group.to_string(), days)));
        Ok(())
    }
}
