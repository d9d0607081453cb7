// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Makes sure the destination group and stream exist before appending.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::client::LogsClient;
use crate::errors::RemoteError;
use crate::model::StreamKey;
use crate::sequence::{SequenceTokenCache, StreamEntry};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningConfig {
    pub auto_create_stream: bool,
    /// Applied to groups created by the forwarder.
    pub retention_in_days: Option<u32>,
    pub group_tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The group or the stream is missing and may not be created.
    Skipped,
}

pub struct ResourceProvisioner {
    client: Arc<dyn LogsClient>,
    cache: Arc<SequenceTokenCache>,
    config: ProvisioningConfig,
}

impl ResourceProvisioner {
    pub fn new(
        client: Arc<dyn LogsClient>,
        cache: Arc<SequenceTokenCache>,
        config: ProvisioningConfig,
    ) -> Self {
        Self {
            client,
            cache,
            config,
        }
    }

    pub fn auto_create_stream(&self) -> bool {
        self.config.auto_create_stream
    }

    pub async fn ensure(&self, key: &StreamKey) -> Result<Readiness, RemoteError> {
        if !self.cache.group_exists(&key.group).await? {
            if !self.config.auto_create_stream {
                warn!(group = %key.group, "Log group '{}' does not exist", key.group);
                return Ok(Readiness::Skipped);
            }
            self.create_group(&key.group).await?;
        }

        if self.cache.lookup_stream(key).await? == StreamEntry::Missing {
            if !self.config.auto_create_stream {
                warn!(
                    group = %key.group,
                    stream = %key.stream,
                    "Log stream '{}' does not exist",
                    key.stream
                );
                return Ok(Readiness::Skipped);
            }
            self.create_stream(key).await?;
        }
        Ok(Readiness::Ready)
    }

    /// Creates `key` again after it disappeared, including its group when
    /// that is gone too. The cached token is reset.
    pub async fn recreate_stream(&self, key: &StreamKey) -> Result<(), RemoteError> {
        match self.create_stream(key).await {
            Err(RemoteError::GroupMissing(_)) => {
                self.create_group(&key.group).await?;
                self.create_stream(key).await
            }
            other => other,
        }
    }

    async fn create_group(&self, group: &str) -> Result<(), RemoteError> {
        match self
            .client
            .create_group(group, self.config.group_tags.as_ref())
            .await
        {
            Ok(()) => {
                info!(group, "created log group");
                if let Some(days) = self.config.retention_in_days {
                    self.client.set_retention(group, days).await?;
                }
            }
            Err(RemoteError::AlreadyExists(_)) => {
                info!(group, "log group already exists");
            }
            Err(err) => return Err(err),
        }
        self.cache.mark_group_exists(group).await;
        Ok(())
    }

    async fn create_stream(&self, key: &StreamKey) -> Result<(), RemoteError> {
        match self.client.create_stream(key).await {
            Ok(()) => {
                info!(group = %key.group, stream = %key.stream, "created log stream");
                self.cache.mark_stream_created(key).await;
                Ok(())
            }
            Err(RemoteError::AlreadyExists(_)) => {
                info!(group = %key.group, stream = %key.stream, "log stream already exists");
                self.cache.refresh_token(key).await.map(|_| ())
            }
            Err(err) => Err(err),
        }
    }
}
