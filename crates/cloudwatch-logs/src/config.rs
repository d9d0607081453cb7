// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment driven configuration for the forwarder.
//!
//! Values are read once into [`ForwarderConfig`], checked with
//! [`ForwarderConfig::validate`], and then converted into the settings of
//! each component. The input side is enabled by `CW_INPUT_TAG`, the output
//! side by any of the output group settings.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use regex::Regex;

use crate::batch::BatchLimits;
use crate::client::ThrottleBackoff;
use crate::commit::RetryPolicy;
use crate::constants;
use crate::errors::ConfigError;
use crate::format::{DestinationSource, FormatConfig};
use crate::parser::{JsonParser, RecordParser, RegexParser, TimeField};
use crate::poller::{Enrichment, PollerConfig, RemoteTime};
use crate::provisioner::ProvisioningConfig;
use crate::resolver::{is_valid_date_pattern, GroupSelector, StreamSelector};

const ENV_ENDPOINT: &str = "CW_ENDPOINT";
const ENV_HTTPS_PROXY: &str = "CW_HTTPS_PROXY";
const ENV_REQUEST_TIMEOUT: &str = "CW_REQUEST_TIMEOUT";
const ENV_LOG_LEVEL: &str = "CW_LOG_LEVEL";

const ENV_INPUT_TAG: &str = "CW_INPUT_TAG";
const ENV_INPUT_GROUP: &str = "CW_INPUT_GROUP";
const ENV_INPUT_GROUP_PREFIX: &str = "CW_INPUT_GROUP_PREFIX";
const ENV_INPUT_STREAM: &str = "CW_INPUT_STREAM";
const ENV_INPUT_STREAM_PREFIX: &str = "CW_INPUT_STREAM_PREFIX";
const ENV_INPUT_STREAM_DATE_PATTERN: &str = "CW_INPUT_STREAM_DATE_PATTERN";
const ENV_INPUT_FETCH_INTERVAL: &str = "CW_INPUT_FETCH_INTERVAL";
const ENV_INPUT_START_TIME: &str = "CW_INPUT_START_TIME";
const ENV_INPUT_END_TIME: &str = "CW_INPUT_END_TIME";
const ENV_INPUT_USE_REMOTE_TIMESTAMP: &str = "CW_INPUT_USE_REMOTE_TIMESTAMP";
const ENV_INPUT_USE_INGESTION_TIME: &str = "CW_INPUT_USE_INGESTION_TIME";
const ENV_INPUT_GROUP_KEY: &str = "CW_INPUT_GROUP_KEY";
const ENV_INPUT_STREAM_KEY: &str = "CW_INPUT_STREAM_KEY";
const ENV_INPUT_INCLUDE_METADATA: &str = "CW_INPUT_INCLUDE_METADATA";
const ENV_INPUT_THROTTLE_RETRY_WAIT: &str = "CW_INPUT_THROTTLE_RETRY_WAIT";
const ENV_INPUT_REGEX: &str = "CW_INPUT_REGEX";
const ENV_INPUT_TIME_KEY: &str = "CW_INPUT_TIME_KEY";
const ENV_INPUT_TIME_FORMAT: &str = "CW_INPUT_TIME_FORMAT";
const ENV_INPUT_KEEP_TIME_KEY: &str = "CW_INPUT_KEEP_TIME_KEY";
const ENV_INPUT_STATE_DIR: &str = "CW_INPUT_STATE_DIR";
const ENV_INPUT_STATE_DB: &str = "CW_INPUT_STATE_DB";
const ENV_INPUT_LEGACY_STATE_FILE: &str = "CW_INPUT_LEGACY_STATE_FILE";

const ENV_OUTPUT_GROUP: &str = "CW_OUTPUT_GROUP";
const ENV_OUTPUT_GROUP_KEY: &str = "CW_OUTPUT_GROUP_KEY";
const ENV_OUTPUT_USE_TAG_AS_GROUP: &str = "CW_OUTPUT_USE_TAG_AS_GROUP";
const ENV_OUTPUT_REMOVE_GROUP_KEY: &str = "CW_OUTPUT_REMOVE_GROUP_KEY";
const ENV_OUTPUT_STREAM: &str = "CW_OUTPUT_STREAM";
const ENV_OUTPUT_STREAM_KEY: &str = "CW_OUTPUT_STREAM_KEY";
const ENV_OUTPUT_USE_TAG_AS_STREAM: &str = "CW_OUTPUT_USE_TAG_AS_STREAM";
const ENV_OUTPUT_REMOVE_STREAM_KEY: &str = "CW_OUTPUT_REMOVE_STREAM_KEY";
const ENV_OUTPUT_INCLUDE_TIME_KEY: &str = "CW_OUTPUT_INCLUDE_TIME_KEY";
const ENV_OUTPUT_TIME_KEY: &str = "CW_OUTPUT_TIME_KEY";
const ENV_OUTPUT_LOCALTIME: &str = "CW_OUTPUT_LOCALTIME";
const ENV_OUTPUT_MESSAGE_KEYS: &str = "CW_OUTPUT_MESSAGE_KEYS";
const ENV_OUTPUT_MAX_MESSAGE_LENGTH: &str = "CW_OUTPUT_MAX_MESSAGE_LENGTH";
const ENV_OUTPUT_AUTO_CREATE_STREAM: &str = "CW_OUTPUT_AUTO_CREATE_STREAM";
const ENV_OUTPUT_RETENTION_DAYS: &str = "CW_OUTPUT_RETENTION_DAYS";
const ENV_OUTPUT_GROUP_TAGS: &str = "CW_OUTPUT_GROUP_TAGS";
const ENV_OUTPUT_RETRY_WAIT: &str = "CW_OUTPUT_RETRY_WAIT";
const ENV_OUTPUT_RETRY_LIMIT: &str = "CW_OUTPUT_RETRY_LIMIT";
const ENV_OUTPUT_RETRY_FOREVER: &str = "CW_OUTPUT_RETRY_FOREVER";
const ENV_OUTPUT_CONCURRENCY: &str = "CW_OUTPUT_CONCURRENCY";
const ENV_OUTPUT_MAX_EVENTS_PER_BATCH: &str = "CW_OUTPUT_MAX_EVENTS_PER_BATCH";
const ENV_OUTPUT_FLUSH_INTERVAL: &str = "CW_OUTPUT_FLUSH_INTERVAL";
const ENV_OUTPUT_BUFFER_CAPACITY: &str = "CW_OUTPUT_BUFFER_CAPACITY";

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TIME_KEY: &str = "time";

/// Where ingestion cursors are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    /// One file per stream in this directory.
    Files(PathBuf),
    Sled(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    pub tag: String,
    pub group_name: Option<String>,
    pub group_prefix: Option<String>,
    pub stream_name: Option<String>,
    pub stream_prefix: Option<String>,
    pub stream_date_pattern: Option<String>,
    pub fetch_interval: Duration,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub use_remote_timestamp: bool,
    pub use_ingestion_time: bool,
    pub enrichment: Enrichment,
    pub throttle_retry_wait: Option<Duration>,
    /// Named-capture pattern; messages are parsed as JSON when unset.
    pub regex: Option<String>,
    pub time_field: Option<TimeField>,
    pub state_dir: Option<PathBuf>,
    pub state_db: Option<PathBuf>,
    pub legacy_state_base: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    pub group_name: Option<String>,
    pub group_key: Option<String>,
    pub use_tag_as_group: bool,
    pub remove_group_key: bool,
    pub stream_name: Option<String>,
    pub stream_key: Option<String>,
    pub use_tag_as_stream: bool,
    pub remove_stream_key: bool,
    pub include_time_key: bool,
    pub time_key: String,
    pub localtime: bool,
    pub message_keys: Vec<String>,
    pub max_message_length: Option<usize>,
    pub auto_create_stream: bool,
    pub retention_in_days: Option<u32>,
    pub group_tags: Option<HashMap<String, String>>,
    pub retry_wait: Duration,
    pub retry_limit: Option<u32>,
    pub retry_forever: bool,
    pub concurrency: usize,
    pub max_events_per_batch: usize,
    pub flush_interval: Duration,
    pub buffer_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderConfig {
    pub endpoint: Option<String>,
    pub https_proxy: Option<String>,
    pub request_timeout: Duration,
    pub log_level: String,
    pub input: Option<InputConfig>,
    pub output: Option<OutputConfig>,
}

impl ForwarderConfig {
    pub fn from_os_env() -> Result<Self, ConfigError> {
        Self::from_env_iter(env::vars())
    }

    /// Builds the configuration from key/value pairs. Malformed values are
    /// rejected here, contradictory ones by [`Self::validate`].
    pub fn from_env_iter<I, K, V>(iter: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let env = Env(&map);

        let input = match env.string(ENV_INPUT_TAG) {
            Some(tag) => Some(InputConfig::from_env(&env, tag)?),
            None => None,
        };
        let output = if [ENV_OUTPUT_GROUP, ENV_OUTPUT_GROUP_KEY, ENV_OUTPUT_USE_TAG_AS_GROUP]
            .iter()
            .any(|key| map.contains_key(*key))
        {
            Some(OutputConfig::from_env(&env)?)
        } else {
            None
        };

        Ok(Self {
            endpoint: env.string(ENV_ENDPOINT),
            https_proxy: env.string(ENV_HTTPS_PROXY),
            request_timeout: env
                .seconds(ENV_REQUEST_TIMEOUT)?
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            log_level: env
                .string(ENV_LOG_LEVEL)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            input,
            output,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input.is_none() && self.output.is_none() {
            return Err(ConfigError::Missing("CW_INPUT_TAG or CW_OUTPUT_GROUP"));
        }
        if self.endpoint.is_none() {
            return Err(ConfigError::Missing(ENV_ENDPOINT));
        }
        if let Some(input) = &self.input {
            input.validate()?;
        }
        if let Some(output) = &self.output {
            output.validate()?;
        }
        Ok(())
    }
}

impl InputConfig {
    fn from_env(env: &Env<'_>, tag: String) -> Result<Self, ConfigError> {
        let time_field = env.string(ENV_INPUT_TIME_KEY).map(|key| TimeField {
            key,
            format: env.string(ENV_INPUT_TIME_FORMAT),
            keep: env.flag(ENV_INPUT_KEEP_TIME_KEY),
        });

        Ok(Self {
            tag,
            group_name: env.string(ENV_INPUT_GROUP),
            group_prefix: env.string(ENV_INPUT_GROUP_PREFIX),
            stream_name: env.string(ENV_INPUT_STREAM),
            stream_prefix: env.string(ENV_INPUT_STREAM_PREFIX),
            stream_date_pattern: env.string(ENV_INPUT_STREAM_DATE_PATTERN),
            fetch_interval: env
                .seconds(ENV_INPUT_FETCH_INTERVAL)?
                .unwrap_or(constants::DEFAULT_FETCH_INTERVAL),
            start_time: env.time(ENV_INPUT_START_TIME)?,
            end_time: env.time(ENV_INPUT_END_TIME)?,
            use_remote_timestamp: env.flag(ENV_INPUT_USE_REMOTE_TIMESTAMP),
            use_ingestion_time: env.flag(ENV_INPUT_USE_INGESTION_TIME),
            enrichment: Enrichment {
                group_key: env.string(ENV_INPUT_GROUP_KEY),
                stream_key: env.string(ENV_INPUT_STREAM_KEY),
                include_metadata: env.flag(ENV_INPUT_INCLUDE_METADATA),
            },
            throttle_retry_wait: env.seconds(ENV_INPUT_THROTTLE_RETRY_WAIT)?,
            regex: env.string(ENV_INPUT_REGEX),
            time_field,
            state_dir: env.string(ENV_INPUT_STATE_DIR).map(PathBuf::from),
            state_db: env.string(ENV_INPUT_STATE_DB).map(PathBuf::from),
            legacy_state_base: env.string(ENV_INPUT_LEGACY_STATE_FILE).map(PathBuf::from),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.group_selector()?;
        self.stream_selector()?;
        if let Some(pattern) = &self.stream_date_pattern {
            if !is_valid_date_pattern(pattern) {
                return Err(ConfigError::Invalid {
                    key: ENV_INPUT_STREAM_DATE_PATTERN,
                    reason: format!("'{pattern}' is not a valid strftime pattern"),
                });
            }
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if end < start {
                return Err(ConfigError::Invalid {
                    key: ENV_INPUT_END_TIME,
                    reason: "end time is before start time".to_string(),
                });
            }
        }
        self.state_backend()?;
        if self.legacy_state_base.is_some()
            && self.state_dir.is_none()
            && self.state_db.is_none()
        {
            return Err(ConfigError::Invalid {
                key: ENV_INPUT_LEGACY_STATE_FILE,
                reason: format!("requires {ENV_INPUT_STATE_DIR} or {ENV_INPUT_STATE_DB}"),
            });
        }
        self.parser()?;
        Ok(())
    }

    pub fn group_selector(&self) -> Result<GroupSelector, ConfigError> {
        match (&self.group_name, &self.group_prefix) {
            (Some(_), Some(_)) => Err(ConfigError::Conflict(ENV_INPUT_GROUP, ENV_INPUT_GROUP_PREFIX)),
            (Some(name), None) => Ok(GroupSelector::Name(name.clone())),
            (None, Some(prefix)) => Ok(GroupSelector::Prefix(prefix.clone())),
            (None, None) => Err(ConfigError::Missing(ENV_INPUT_GROUP)),
        }
    }

    pub fn stream_selector(&self) -> Result<StreamSelector, ConfigError> {
        match (
            &self.stream_name,
            &self.stream_prefix,
            &self.stream_date_pattern,
        ) {
            (Some(name), None, None) => Ok(StreamSelector::Name(name.clone())),
            (None, Some(prefix), None) => Ok(StreamSelector::Prefix(prefix.clone())),
            (None, None, Some(pattern)) => Ok(StreamSelector::DatePattern(pattern.clone())),
            (None, None, None) => Err(ConfigError::Missing(ENV_INPUT_STREAM)),
            (Some(_), Some(_), _) => Err(ConfigError::Conflict(ENV_INPUT_STREAM, ENV_INPUT_STREAM_PREFIX)),
            (Some(_), None, Some(_)) => Err(ConfigError::Conflict(
                ENV_INPUT_STREAM,
                ENV_INPUT_STREAM_DATE_PATTERN,
            )),
            (None, Some(_), Some(_)) => Err(ConfigError::Conflict(
                ENV_INPUT_STREAM_PREFIX,
                ENV_INPUT_STREAM_DATE_PATTERN,
            )),
        }
    }

    pub fn state_backend(&self) -> Result<StateBackend, ConfigError> {
        match (&self.state_dir, &self.state_db) {
            (Some(_), Some(_)) => Err(ConfigError::Conflict(ENV_INPUT_STATE_DIR, ENV_INPUT_STATE_DB)),
            (Some(dir), None) => Ok(StateBackend::Files(dir.clone())),
            (None, Some(db)) => Ok(StateBackend::Sled(db.clone())),
            (None, None) => Ok(StateBackend::Memory),
        }
    }

    pub fn parser(&self) -> Result<Arc<dyn RecordParser>, ConfigError> {
        match &self.regex {
            Some(pattern) => {
                let regex = Regex::new(pattern).map_err(|e| ConfigError::Invalid {
                    key: ENV_INPUT_REGEX,
                    reason: e.to_string(),
                })?;
                if regex.capture_names().flatten().next().is_none() {
                    return Err(ConfigError::Invalid {
                        key: ENV_INPUT_REGEX,
                        reason: "pattern has no named captures".to_string(),
                    });
                }
                Ok(Arc::new(RegexParser::new(regex, self.time_field.clone())))
            }
            None => Ok(Arc::new(JsonParser {
                time_field: self.time_field.clone(),
            })),
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            fetch_interval: self.fetch_interval,
            start_time: self.start_time,
            end_time: self.end_time,
            use_remote_timestamp: self.use_remote_timestamp,
            remote_time: if self.use_ingestion_time {
                RemoteTime::IngestionTime
            } else {
                RemoteTime::Timestamp
            },
            enrichment: self.enrichment.clone(),
            throttle_backoff: self.throttle_retry_wait.map(ThrottleBackoff::new),
            ..PollerConfig::new(self.tag.clone())
        }
    }
}

impl OutputConfig {
    fn from_env(env: &Env<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            group_name: env.string(ENV_OUTPUT_GROUP),
            group_key: env.string(ENV_OUTPUT_GROUP_KEY),
            use_tag_as_group: env.flag(ENV_OUTPUT_USE_TAG_AS_GROUP),
            remove_group_key: env.flag(ENV_OUTPUT_REMOVE_GROUP_KEY),
            stream_name: env.string(ENV_OUTPUT_STREAM),
            stream_key: env.string(ENV_OUTPUT_STREAM_KEY),
            use_tag_as_stream: env.flag(ENV_OUTPUT_USE_TAG_AS_STREAM),
            remove_stream_key: env.flag(ENV_OUTPUT_REMOVE_STREAM_KEY),
            include_time_key: env.flag(ENV_OUTPUT_INCLUDE_TIME_KEY),
            time_key: env
                .string(ENV_OUTPUT_TIME_KEY)
                .unwrap_or_else(|| DEFAULT_TIME_KEY.to_string()),
            localtime: env.flag(ENV_OUTPUT_LOCALTIME),
            message_keys: env
                .string(ENV_OUTPUT_MESSAGE_KEYS)
                .map(|keys| {
                    keys.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            max_message_length: env.number(ENV_OUTPUT_MAX_MESSAGE_LENGTH)?,
            auto_create_stream: env.flag(ENV_OUTPUT_AUTO_CREATE_STREAM),
            retention_in_days: env.number(ENV_OUTPUT_RETENTION_DAYS)?,
            group_tags: env.string(ENV_OUTPUT_GROUP_TAGS).map(|s| parse_tags(&s)),
            retry_wait: env
                .seconds(ENV_OUTPUT_RETRY_WAIT)?
                .unwrap_or(constants::DEFAULT_RETRY_WAIT),
            retry_limit: env.number(ENV_OUTPUT_RETRY_LIMIT)?,
            retry_forever: env.flag(ENV_OUTPUT_RETRY_FOREVER),
            concurrency: env
                .number(ENV_OUTPUT_CONCURRENCY)?
                .unwrap_or(constants::DEFAULT_CONCURRENCY),
            max_events_per_batch: env
                .number(ENV_OUTPUT_MAX_EVENTS_PER_BATCH)?
                .unwrap_or(constants::MAX_EVENT_COUNT),
            flush_interval: env
                .seconds(ENV_OUTPUT_FLUSH_INTERVAL)?
                .unwrap_or(DEFAULT_FLUSH_INTERVAL),
            buffer_capacity: env
                .number(ENV_OUTPUT_BUFFER_CAPACITY)?
                .unwrap_or(constants::DEFAULT_BUFFER_CAPACITY),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.format_config()?;
        if self.retry_limit.is_some() && self.retry_forever {
            return Err(ConfigError::Conflict(ENV_OUTPUT_RETRY_LIMIT, ENV_OUTPUT_RETRY_FOREVER));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_OUTPUT_CONCURRENCY,
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_events_per_batch == 0 || self.max_events_per_batch > constants::MAX_EVENT_COUNT {
            return Err(ConfigError::Invalid {
                key: ENV_OUTPUT_MAX_EVENTS_PER_BATCH,
                reason: format!("must be between 1 and {}", constants::MAX_EVENT_COUNT),
            });
        }
        if self.max_message_length == Some(0) {
            return Err(ConfigError::Invalid {
                key: ENV_OUTPUT_MAX_MESSAGE_LENGTH,
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn format_config(&self) -> Result<FormatConfig, ConfigError> {
        let group = destination(
            self.group_name.as_ref(),
            self.group_key.as_ref(),
            self.use_tag_as_group,
            self.remove_group_key,
            [ENV_OUTPUT_GROUP, ENV_OUTPUT_GROUP_KEY, ENV_OUTPUT_USE_TAG_AS_GROUP],
        )?;
        let stream = destination(
            self.stream_name.as_ref(),
            self.stream_key.as_ref(),
            self.use_tag_as_stream,
            self.remove_stream_key,
            [ENV_OUTPUT_STREAM, ENV_OUTPUT_STREAM_KEY, ENV_OUTPUT_USE_TAG_AS_STREAM],
        )?;

        Ok(FormatConfig {
            include_time_key: self.include_time_key,
            time_key: self.time_key.clone(),
            localtime: self.localtime,
            message_keys: self.message_keys.clone(),
            max_message_length: self.max_message_length,
            ..FormatConfig::new(group, stream)
        })
    }

    pub fn provisioning_config(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            auto_create_stream: self.auto_create_stream,
            retention_in_days: self.retention_in_days,
            group_tags: self.group_tags.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_wait: self.retry_wait,
            retry_limit: if self.retry_forever {
                None
            } else {
                Some(self.retry_limit.unwrap_or(constants::DEFAULT_RETRY_LIMIT))
            },
            ..RetryPolicy::default()
        }
    }

    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_event_count: self.max_events_per_batch,
            ..BatchLimits::default()
        }
    }
}

/// Exactly one of a fixed name, a record key, or the tag.
fn destination(
    name: Option<&String>,
    key: Option<&String>,
    use_tag: bool,
    remove_key: bool,
    names: [&'static str; 3],
) -> Result<DestinationSource, ConfigError> {
    match (name, key, use_tag) {
        (Some(name), None, false) => Ok(DestinationSource::Fixed(name.clone())),
        (None, Some(key), false) => Ok(DestinationSource::RecordKey {
            key: key.clone(),
            remove: remove_key,
        }),
        (None, None, true) => Ok(DestinationSource::Tag),
        (None, None, false) => Err(ConfigError::Missing(names[0])),
        (Some(_), Some(_), _) => Err(ConfigError::Conflict(names[0], names[1])),
        (Some(_), None, true) => Err(ConfigError::Conflict(names[0], names[2])),
        (None, Some(_), true) => Err(ConfigError::Conflict(names[1], names[2])),
    }
}

struct Env<'a>(&'a HashMap<String, String>);

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        self.0.get(key).map(|v| v.trim().to_string())
    }

    fn flag(&self, key: &str) -> bool {
        parse_bool(self.0.get(key).map(String::as_str), false)
    }

    fn number<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.0
            .get(key)
            .map(|v| {
                v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                    key,
                    reason: format!("'{v}': {e}"),
                })
            })
            .transpose()
    }

    /// Fractional seconds.
    fn seconds(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        let Some(secs) = self.number::<f64>(key)? else {
            return Ok(None);
        };
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("'{secs}': {e}"),
            })
    }

    /// Milliseconds since the epoch, or an RFC 3339 timestamp.
    fn time(&self, key: &'static str) -> Result<Option<i64>, ConfigError> {
        let Some(value) = self.string(key) else {
            return Ok(None);
        };
        if let Ok(millis) = value.parse::<i64>() {
            return Ok(Some(millis));
        }
        DateTime::parse_from_rfc3339(&value)
            .map(|t| Some(t.timestamp_millis()))
            .map_err(|e| ConfigError::Invalid {
                key,
                reason: format!("'{value}': {e}"),
            })
    }
}

fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

/// `key=value` pairs separated by commas. Entries without `=` are ignored.
fn parse_tags(value: &str) -> HashMap<String, String> {
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
