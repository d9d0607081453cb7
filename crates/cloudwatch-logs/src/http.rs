// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! [`LogsClient`] speaking the service's JSON-over-HTTP dialect.
//!
//! Every operation is a `POST` to the endpoint root with the operation named
//! in the `X-Amz-Target` header. Failures carry their error code in the
//! `__type` field of the response body, which is mapped onto
//! [`RemoteError`]. Credentials are out of scope: requests can be signed
//! through a [`RequestSigner`], or sent unsigned to a signing proxy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{EventsPage, GetEventsRequest, GroupsPage, LogsClient, RemoteStream, StreamsPage};
use crate::errors::RemoteError;
use crate::model::{FetchedEvent, PendingRecord, StreamKey};

const TARGET_PREFIX: &str = "Logs_20140328";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.1";

/// Adds authentication to an outgoing request.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, request: &mut reqwest::Request) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    pub https_proxy: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            https_proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct HttpLogsClient {
    client: reqwest::Client,
    endpoint: String,
    signer: Option<Arc<dyn RequestSigner>>,
}

impl std::fmt::Debug for HttpLogsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLogsClient")
            .field("endpoint", &self.endpoint)
            .field("signed", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl HttpLogsClient {
    pub fn new(endpoint: impl Into<String>, options: &HttpClientOptions) -> Result<Self, RemoteError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .timeout(options.timeout);
        if let Some(proxy) = &options.https_proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| RemoteError::Transport(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            signer: None,
        })
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    async fn call<B, R>(&self, operation: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|e| RemoteError::Transport(format!("failed to encode {operation}: {e}")))?;
        let mut request = self
            .client
            .post(format!("{}/", self.endpoint))
            .header("X-Amz-Target", format!("{TARGET_PREFIX}.{operation}"))
            .body(payload)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        if let Some(signer) = &self.signer {
            signer.sign(&mut request).await?;
        }

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        debug!(operation, status = %status, body_len = bytes.len(), "logs API response");

        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &bytes));
        }
        // Operations without output answer with an empty body.
        let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(bytes)
            .map_err(|e| RemoteError::Transport(format!("invalid {operation} response: {e}")))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
    #[serde(rename = "expectedSequenceToken", default)]
    expected_sequence_token: Option<String>,
}

/// Maps an error response onto the remote error taxonomy.
fn classify_error(status: u16, body: &[u8]) -> RemoteError {
    let error: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    // `__type` may be namespaced: `com.amazonaws.logs#ThrottlingException`.
    let code = error.kind.rsplit('#').next().unwrap_or_default();
    let message = error.message;

    match code {
        "ThrottlingException" => RemoteError::Throttled(message),
        "InvalidSequenceTokenException" | "DataAlreadyAcceptedException" => {
            RemoteError::TokenConflict {
                expected: error.expected_sequence_token,
                message,
            }
        }
        "ResourceNotFoundException" => {
            if message.to_ascii_lowercase().contains("log group") {
                RemoteError::GroupMissing(message)
            } else {
                RemoteError::StreamMissing(message)
            }
        }
        "ResourceAlreadyExistsException" => RemoteError::AlreadyExists(message),
        "" if status == 429 => RemoteError::Throttled(format!("HTTP {status}")),
        "" => RemoteError::Other {
            code: format!("HTTP {status}"),
            message: String::from_utf8_lossy(body).into_owned(),
        },
        other => RemoteError::Other {
            code: other.to_string(),
            message,
        },
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroupsInput<'a> {
    log_group_name_prefix: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogGroupsOutput {
    #[serde(default)]
    log_groups: Vec<LogGroupOutput>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogGroupOutput {
    log_group_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsInput<'a> {
    log_group_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_stream_name_prefix: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeLogStreamsOutput {
    #[serde(default)]
    log_streams: Vec<LogStreamOutput>,
    next_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStreamOutput {
    log_stream_name: String,
    upload_sequence_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetLogEventsInput<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_time: Option<i64>,
    start_from_head: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetLogEventsOutput {
    #[serde(default)]
    events: Vec<OutputLogEvent>,
    next_forward_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputLogEvent {
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    ingestion_time: i64,
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsInput<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
    log_events: Vec<InputLogEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_token: Option<&'a str>,
}

#[derive(Serialize)]
struct InputLogEvent {
    timestamp: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutLogEventsOutput {
    next_sequence_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogGroupInput<'a> {
    log_group_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a HashMap<String, String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStreamInput<'a> {
    log_group_name: &'a str,
    log_stream_name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PutRetentionPolicyInput<'a> {
    log_group_name: &'a str,
    retention_in_days: u32,
}

#[derive(Deserialize)]
struct Empty {}

#[async_trait]
impl LogsClient for HttpLogsClient {
    async fn list_groups(
        &self,
        prefix: &str,
        next_token: Option<&str>,
    ) -> Result<GroupsPage, RemoteError> {
        let output: DescribeLogGroupsOutput = self
            .call(
                "DescribeLogGroups",
                &DescribeLogGroupsInput {
                    log_group_name_prefix: prefix,
                    next_token,
                },
            )
            .await?;
        Ok(GroupsPage {
            groups: output.log_groups.into_iter().map(|g| g.log_group_name).collect(),
            next_token: output.next_token,
        })
    }

    async fn list_streams(
        &self,
        group: &str,
        prefix: Option<&str>,
        next_token: Option<&str>,
    ) -> Result<StreamsPage, RemoteError> {
        let output: DescribeLogStreamsOutput = self
            .call(
                "DescribeLogStreams",
                &DescribeLogStreamsInput {
                    log_group_name: group,
                    log_stream_name_prefix: prefix,
                    next_token,
                },
            )
            .await
            .map_err(not_found_is_group)?;
        Ok(StreamsPage {
            streams: output
                .log_streams
                .into_iter()
                .map(|s| RemoteStream {
                    name: s.log_stream_name,
                    upload_sequence_token: s.upload_sequence_token,
                })
                .collect(),
            next_token: output.next_token,
        })
    }

    async fn get_events(&self, request: &GetEventsRequest) -> Result<EventsPage, RemoteError> {
        let output: GetLogEventsOutput = self
            .call(
                "GetLogEvents",
                &GetLogEventsInput {
                    log_group_name: &request.key.group,
                    log_stream_name: &request.key.stream,
                    next_token: request.next_token.as_deref(),
                    start_time: request.start_time,
                    end_time: request.end_time,
                    start_from_head: request.start_from_head,
                },
            )
            .await?;
        Ok(EventsPage {
            events: output
                .events
                .into_iter()
                .map(|e| FetchedEvent {
                    timestamp: e.timestamp,
                    ingestion_time: e.ingestion_time,
                    message: e.message,
                })
                .collect(),
            next_forward_token: output.next_forward_token,
        })
    }

    async fn put_events(
        &self,
        key: &StreamKey,
        sequence_token: Option<&str>,
        records: &[PendingRecord],
    ) -> Result<Option<String>, RemoteError> {
        let log_events = records
            .iter()
            .map(|r| InputLogEvent {
                timestamp: r.timestamp,
                message: String::from_utf8_lossy(&r.payload).into_owned(),
            })
            .collect();
        let output: PutLogEventsOutput = self
            .call(
                "PutLogEvents",
                &PutLogEventsInput {
                    log_group_name: &key.group,
                    log_stream_name: &key.stream,
                    log_events,
                    sequence_token,
                },
            )
            .await?;
        Ok(output.next_sequence_token)
    }

    async fn create_group(
        &self,
        group: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<(), RemoteError> {
        let _: Empty = self
            .call(
                "CreateLogGroup",
                &CreateLogGroupInput {
                    log_group_name: group,
                    tags,
                },
            )
            .await?;
        Ok(())
    }

    async fn create_stream(&self, key: &StreamKey) -> Result<(), RemoteError> {
        let _: Empty = self
            .call(
                "CreateLogStream",
                &CreateLogStreamInput {
                    log_group_name: &key.group,
                    log_stream_name: &key.stream,
                },
            )
            .await
            .map_err(not_found_is_group)?;
        Ok(())
    }

    async fn set_retention(&self, group: &str, days: u32) -> Result<(), RemoteError> {
        let _: Empty = self
            .call(
                "PutRetentionPolicy",
                &PutRetentionPolicyInput {
                    log_group_name: group,
                    retention_in_days: days,
                },
            )
            .await?;
        Ok(())
    }
}

/// Listing or creating streams can only miss the group.
fn not_found_is_group(err: RemoteError) -> RemoteError {
    match err {
        RemoteError::StreamMissing(message) => RemoteError::GroupMissing(message),
        other => other,
    }
}
