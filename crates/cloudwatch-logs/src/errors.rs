// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types, one enum per concern.

/// Failures reported by the remote log service, already classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// The service is rate limiting this caller.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// The upload token was stale, or the batch was already accepted.
    #[error("sequence token rejected: {message}")]
    TokenConflict {
        /// Token the service expects next, when it says so.
        expected: Option<String>,
        message: String,
    },

    #[error("log group does not exist: {0}")]
    GroupMissing(String),

    #[error("log stream does not exist: {0}")]
    StreamMissing(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    /// Any other error code returned by the service.
    #[error("{code}: {message}")]
    Other { code: String, message: String },

    /// The request never produced a service response.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::GroupMissing(_) | Self::StreamMissing(_))
    }
}

/// Errors emitted by cursor storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] sled::Error),
    #[error("stored value is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Errors raised while decoding a fetched message into a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("pattern does not match")]
    NoMatch,
    #[error("invalid time value '{value}': {reason}")]
    InvalidTime { value: String, reason: String },
}

/// Failure of one stream within an ingestion cycle.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("cursor store failure: {0}")]
    Store(#[from] StoreError),
}

/// Invalid or contradictory configuration, reported at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("{0} and {1} cannot be used together")]
    Conflict(&'static str, &'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
