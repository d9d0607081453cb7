// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Expansion of configured group and stream names into concrete streams.
//!
//! Literal names resolve without remote calls. Prefixes are expanded by
//! following listing continuation tokens until the service reports none.
//! Date patterns are formatted for yesterday and today (UTC) and each
//! result is expanded as a prefix, so streams named after yesterday keep
//! being read shortly after midnight.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Days, Utc};
use tracing::{debug, warn};

use crate::client::{call_with_throttle_retry, LogsClient, ThrottleBackoff};
use crate::clock::Clock;
use crate::errors::RemoteError;
use crate::model::{StreamDescriptor, StreamKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupSelector {
    Name(String),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelector {
    Name(String),
    Prefix(String),
    /// strftime pattern, e.g. `app-%Y-%m-%d`.
    DatePattern(String),
}

/// Returns `false` when `pattern` holds a specifier chrono cannot format.
pub fn is_valid_date_pattern(pattern: &str) -> bool {
    !StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error))
}

/// Formats `time` with a strftime `pattern`, `None` when the pattern is
/// invalid.
pub fn format_date(time: &DateTime<Utc>, pattern: &str) -> Option<String> {
    if !is_valid_date_pattern(pattern) {
        return None;
    }
    let mut out = String::new();
    write!(out, "{}", time.format(pattern)).ok()?;
    Some(out)
}

pub struct StreamResolver {
    client: Arc<dyn LogsClient>,
    clock: Arc<dyn Clock>,
    group: GroupSelector,
    stream: StreamSelector,
    throttle_backoff: Option<ThrottleBackoff>,
    max_pages: Option<usize>,
}

impl StreamResolver {
    pub fn new(
        client: Arc<dyn LogsClient>,
        clock: Arc<dyn Clock>,
        group: GroupSelector,
        stream: StreamSelector,
    ) -> Self {
        Self {
            client,
            clock,
            group,
            stream,
            throttle_backoff: None,
            max_pages: None,
        }
    }

    #[must_use]
    pub fn with_throttle_backoff(mut self, backoff: Option<ThrottleBackoff>) -> Self {
        self.throttle_backoff = backoff;
        self
    }

    /// Stops listing after `max_pages` pages per expansion.
    #[must_use]
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Whether the result can change from one cycle to the next.
    pub fn is_dynamic(&self) -> bool {
        !matches!(
            (&self.group, &self.stream),
            (GroupSelector::Name(_), StreamSelector::Name(_))
        )
    }

    /// Streams to poll this cycle.
    ///
    /// A group reported missing while listing contributes no streams; any
    /// other listing failure is returned.
    pub async fn resolve(&self) -> Result<Vec<StreamDescriptor>, RemoteError> {
        let (groups, groups_discovered) = match &self.group {
            GroupSelector::Name(name) => (vec![name.clone()], false),
            GroupSelector::Prefix(prefix) => (self.list_groups(prefix).await?, true),
        };

        let mut descriptors = Vec::new();
        for group in groups {
            let streams = match &self.stream {
                StreamSelector::Name(name) => {
                    descriptors.push(StreamDescriptor {
                        key: StreamKey::new(group, name.clone()),
                        discovered: groups_discovered,
                    });
                    continue;
                }
                StreamSelector::Prefix(prefix) => self.list_streams(&group, prefix).await,
                StreamSelector::DatePattern(pattern) => self.list_dated_streams(&group, pattern).await,
            };
            match streams {
                Ok(names) => descriptors.extend(names.into_iter().map(|stream| StreamDescriptor {
                    key: StreamKey::new(group.clone(), stream),
                    discovered: true,
                })),
                Err(err) if err.is_not_found() => {
                    warn!(group = %group, error = %err, "log group not found, no streams this cycle");
                }
                Err(err) => return Err(err),
            }
        }
        debug!(count = descriptors.len(), "resolved streams");
        Ok(descriptors)
    }

    async fn list_groups(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut groups = Vec::new();
        let mut next_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = call_with_throttle_retry(
                self.clock.as_ref(),
                self.throttle_backoff,
                "DescribeLogGroups",
                || self.client.list_groups(prefix, next_token.as_deref()),
            )
            .await?;
            groups.extend(page.groups);
            pages += 1;
            match page.next_token {
                Some(token) if !self.page_cap_reached(pages) => next_token = Some(token),
                _ => return Ok(groups),
            }
        }
    }

    async fn list_streams(&self, group: &str, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut streams = Vec::new();
        let mut next_token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = call_with_throttle_retry(
                self.clock.as_ref(),
                self.throttle_backoff,
                "DescribeLogStreams",
                || {
                    self.client
                        .list_streams(group, Some(prefix), next_token.as_deref())
                },
            )
            .await?;
            streams.extend(page.streams.into_iter().map(|s| s.name));
            pages += 1;
            match page.next_token {
                Some(token) if !self.page_cap_reached(pages) => next_token = Some(token),
                _ => return Ok(streams),
            }
        }
    }

    async fn list_dated_streams(
        &self,
        group: &str,
        pattern: &str,
    ) -> Result<Vec<String>, RemoteError> {
        let today = self.clock.now();
        let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);

        let mut prefixes: Vec<String> = Vec::with_capacity(2);
        for day in [yesterday, today] {
            match format_date(&day, pattern) {
                Some(prefix) if !prefixes.contains(&prefix) => prefixes.push(prefix),
                Some(_) => {}
                None => {
                    warn!(pattern, "invalid stream date pattern");
                    return Ok(Vec::new());
                }
            }
        }

        let mut streams: Vec<String> = Vec::new();
        for prefix in prefixes {
            for name in self.list_streams(group, &prefix).await? {
                if !streams.contains(&name) {
                    streams.push(name);
                }
            }
        }
        Ok(streams)
    }

    fn page_cap_reached(&self, pages: usize) -> bool {
        self.max_pages.is_some_and(|max| pages >= max)
    }
}
