// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Appends one batch to one stream.
//!
//! Each attempt presents the cached upload token and stores the token the
//! service hands back. Failures are classified:
//! - token conflict: pause, look the stream up again, retry (no limit)
//! - stream or group gone while auto-provisioning: recreate, retry
//! - throttling: exponential backoff with jitter, bounded by the retry limit
//! - anything else: returned to the caller
//!
//! Throttled lookups and creates made for the batch (destination checks,
//! token refreshes, stream recreation) back off the same way and share the
//! batch's retry budget.
//!
//! Callers must serialize commits per stream; the token chain breaks when
//! two appends to the same stream run concurrently.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::LogsClient;
use crate::clock::Clock;
use crate::constants;
use crate::errors::RemoteError;
use crate::model::{Batch, StreamKey};
use crate::provisioner::{Readiness, ResourceProvisioner};
use crate::sequence::SequenceTokenCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First throttling backoff; doubled after every throttled attempt.
    pub base_wait: Duration,
    /// Throttling retries before the batch is dropped. `None` never drops.
    pub retry_limit: Option<u32>,
    pub token_resync_pause: Duration,
    /// Token resyncs allowed per batch. `None` keeps resyncing.
    pub max_token_resyncs: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_wait: constants::DEFAULT_RETRY_WAIT,
            retry_limit: Some(constants::DEFAULT_RETRY_LIMIT),
            token_resync_pause: constants::TOKEN_RESYNC_PAUSE,
            max_token_resyncs: None,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (zero based), jittered by ±12.5%.
    pub fn throttle_wait(&self, retry: u32) -> Duration {
        let jitter = 1.0 + 0.25 * (rand::thread_rng().gen::<f64>() - 0.5);
        let exponent = i32::try_from(retry.min(62)).unwrap_or(62);
        let secs = self.base_wait.as_secs_f64() * 2f64.powi(exponent) * jitter;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { attempts: u32 },
    /// The destination is missing and may not be created.
    Skipped,
    /// Throttled past the retry limit; the batch is lost.
    Dropped { attempts: u32 },
    /// Cancelled while waiting to retry.
    Interrupted,
}

/// Why a commit ended before the batch was appended.
enum Halt {
    Outcome(CommitOutcome),
    Failed(RemoteError),
}

impl From<RemoteError> for Halt {
    fn from(err: RemoteError) -> Self {
        Halt::Failed(err)
    }
}

/// Counters of one commit.
#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    /// Shared by the append and the lookups made on its behalf.
    throttle_retries: u32,
    token_resyncs: u32,
    recreated: bool,
}

pub struct CommitEngine {
    client: Arc<dyn LogsClient>,
    cache: Arc<SequenceTokenCache>,
    provisioner: Arc<ResourceProvisioner>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl CommitEngine {
    pub fn new(
        client: Arc<dyn LogsClient>,
        cache: Arc<SequenceTokenCache>,
        provisioner: Arc<ResourceProvisioner>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            cache,
            provisioner,
            clock,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Backoff and resync pauses end early once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn commit(&self, key: &StreamKey, batch: &Batch) -> Result<CommitOutcome, RemoteError> {
        if batch.is_empty() {
            return Ok(CommitOutcome::Skipped);
        }
        match self.try_commit(key, batch).await {
            Ok(outcome) | Err(Halt::Outcome(outcome)) => Ok(outcome),
            Err(Halt::Failed(err)) => Err(err),
        }
    }

    async fn try_commit(&self, key: &StreamKey, batch: &Batch) -> Result<CommitOutcome, Halt> {
        let mut progress = Progress::default();

        let readiness = self
            .throttled(key, batch, &mut progress, "look up destination", || {
                self.provisioner.ensure(key)
            })
            .await?;
        if readiness == Readiness::Skipped {
            warn!(
                group = %key.group,
                stream = %key.stream,
                events = batch.len(),
                "destination unavailable, skipping batch"
            );
            return Ok(CommitOutcome::Skipped);
        }

        loop {
            let token = self.cache.get(key).await;
            progress.attempts += 1;
            debug!(
                group = %key.group,
                stream = %key.stream,
                attempt = progress.attempts,
                events = batch.len(),
                "Calling PutLogEvents API"
            );

            let err = match self
                .client
                .put_events(key, token.as_deref(), &batch.records)
                .await
            {
                Ok(next_token) => {
                    self.cache.set(key, next_token).await;
                    if progress.throttle_retries > 0 {
                        info!(
                            group = %key.group,
                            stream = %key.stream,
                            attempt = progress.attempts,
                            "retry succeeded"
                        );
                    }
                    return Ok(CommitOutcome::Committed {
                        attempts: progress.attempts,
                    });
                }
                Err(err) => err,
            };

            match err {
                RemoteError::TokenConflict { expected, message } => {
                    if self
                        .policy
                        .max_token_resyncs
                        .is_some_and(|max| progress.token_resyncs >= max)
                    {
                        return Err(RemoteError::TokenConflict { expected, message }.into());
                    }
                    progress.token_resyncs += 1;
                    warn!(
                        group = %key.group,
                        stream = %key.stream,
                        attempt = progress.attempts,
                        expected = expected.as_deref().unwrap_or("none"),
                        next_retry = %self.retry_time(self.policy.token_resync_pause),
                        "failed to PutLogEvents, refreshing sequence token: {message}"
                    );
                    self.pause(key, progress.attempts, self.policy.token_resync_pause)
                        .await?;
                    self.throttled(key, batch, &mut progress, "refresh sequence token", || {
                        self.cache.refresh_token(key)
                    })
                    .await?;
                }
                RemoteError::StreamMissing(_) | RemoteError::GroupMissing(_)
                    if self.provisioner.auto_create_stream() && !progress.recreated =>
                {
                    warn!(
                        group = %key.group,
                        stream = %key.stream,
                        attempt = progress.attempts,
                        error = %err,
                        "destination disappeared, recreating it"
                    );
                    progress.recreated = true;
                    self.cache.forget(key).await;
                    self.throttled(key, batch, &mut progress, "recreate log stream", || {
                        self.provisioner.recreate_stream(key)
                    })
                    .await?;
                }
                RemoteError::Throttled(message) => {
                    self.back_off(key, batch, &mut progress, "PutLogEvents", &message)
                        .await?;
                }
                err => {
                    error!(
                        group = %key.group,
                        stream = %key.stream,
                        attempt = progress.attempts,
                        error = %err,
                        "failed to PutLogEvents"
                    );
                    return Err(err.into());
                }
            }
        }
    }

    /// Runs a lookup or create call on behalf of a commit. Throttling backs
    /// off under the same policy and retry budget as the append itself.
    async fn throttled<T, F, Fut>(
        &self,
        key: &StreamKey,
        batch: &Batch,
        progress: &mut Progress,
        operation: &str,
        mut call: F,
    ) -> Result<T, Halt>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        loop {
            match call().await {
                Err(RemoteError::Throttled(message)) => {
                    self.back_off(key, batch, progress, operation, &message)
                        .await?;
                }
                other => return other.map_err(Halt::Failed),
            }
        }
    }

    async fn back_off(
        &self,
        key: &StreamKey,
        batch: &Batch,
        progress: &mut Progress,
        operation: &str,
        message: &str,
    ) -> Result<(), Halt> {
        if self
            .policy
            .retry_limit
            .is_some_and(|limit| progress.throttle_retries >= limit)
        {
            error!(
                group = %key.group,
                stream = %key.stream,
                attempt = progress.attempts,
                events = batch.len(),
                "failed to {operation} and discard logs: {message}"
            );
            return Err(Halt::Outcome(CommitOutcome::Dropped {
                attempts: progress.attempts,
            }));
        }
        let wait = self.policy.throttle_wait(progress.throttle_retries);
        progress.throttle_retries += 1;
        warn!(
            group = %key.group,
            stream = %key.stream,
            attempt = progress.attempts,
            wait_ms = wait.as_millis() as u64,
            next_retry = %self.retry_time(wait),
            "failed to {operation}: {message}"
        );
        self.pause(key, progress.attempts, wait).await
    }

    /// Sleeps for `duration` unless cancelled first.
    async fn pause(&self, key: &StreamKey, attempts: u32, duration: Duration) -> Result<(), Halt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Outcome(self.interrupted(key, attempts))),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }

    fn interrupted(&self, key: &StreamKey, attempts: u32) -> CommitOutcome {
        warn!(
            group = %key.group,
            stream = %key.stream,
            attempt = attempts,
            "shutdown requested while retrying PutLogEvents, batch not committed"
        );
        CommitOutcome::Interrupted
    }

    fn retry_time(&self, wait: Duration) -> String {
        let wait_ms = i64::try_from(wait.as_millis()).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_millis(self.clock.now_millis().saturating_add(wait_ms))
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::PendingRecord;
    use crate::provisioner::ProvisioningConfig;
    use crate::testing::FakeLogsClient;
    use tracing_test::traced_test;

    const T: i64 = 1_700_000_000_000;

    fn key() -> StreamKey {
        StreamKey::new("g", "s")
    }

    fn batch() -> Batch {
        Batch {
            records: vec![
                PendingRecord::new(T, r#"{"msg":"a"}"#),
                PendingRecord::new(T + 1, r#"{"msg":"b"}"#),
            ],
        }
    }

    struct Fixture {
        client: Arc<FakeLogsClient>,
        cache: Arc<SequenceTokenCache>,
        clock: Arc<ManualClock>,
        engine: CommitEngine,
    }

    fn fixture(client: FakeLogsClient, auto_create_stream: bool, policy: RetryPolicy) -> Fixture {
        let client = Arc::new(client);
        let cache = Arc::new(SequenceTokenCache::new(client.clone()));
        let provisioner = Arc::new(ResourceProvisioner::new(
            client.clone(),
            cache.clone(),
            ProvisioningConfig {
                auto_create_stream,
                ..ProvisioningConfig::default()
            },
        ));
        let clock = Arc::new(ManualClock::new(T));
        let engine = CommitEngine::new(
            client.clone(),
            cache.clone(),
            provisioner,
            clock.clone(),
            policy,
        );
        Fixture {
            client,
            cache,
            clock,
            engine,
        }
    }

    fn existing_stream(token: Option<&str>) -> FakeLogsClient {
        let client = FakeLogsClient::new();
        client.add_stream(&key(), token);
        client
    }

    fn fast_policy(retry_limit: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            base_wait: Duration::from_millis(100),
            retry_limit,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_first_append_without_token_stores_next_token() {
        let f = fixture(existing_stream(None), false, RetryPolicy::default());
        f.client.push_put_result(Ok(Some("49590".into())));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { attempts: 1 });
        let calls = f.client.put_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].token, None);
        assert_eq!(calls[0].records, batch().records);
        assert_eq!(f.cache.get(&key()).await.as_deref(), Some("49590"));
    }

    #[tokio::test]
    async fn test_successive_commits_chain_tokens() {
        let f = fixture(existing_stream(Some("t0")), false, RetryPolicy::default());

        f.engine.commit(&key(), &batch()).await.unwrap();
        f.engine.commit(&key(), &batch()).await.unwrap();

        let tokens: Vec<Option<String>> = f.client.put_calls().into_iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec![Some("t0".to_string()), Some("token-1".to_string())]);
    }

    #[tokio::test]
    async fn test_token_conflict_resyncs_once() {
        let client = FakeLogsClient::new();
        client.add_group("g");
        client.add_stream_page("g", vec![("s", Some("stale"))], None);
        client.add_stream_page("g", vec![("s", Some("fresh"))], None);
        client.push_put_result(Err(RemoteError::TokenConflict {
            expected: Some("fresh".into()),
            message: "The given sequenceToken is invalid".into(),
        }));
        client.push_put_result(Ok(Some("next".into())));
        let f = fixture(client, false, RetryPolicy::default());

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { attempts: 2 });
        // One lookup when the stream is first seen, one resync.
        assert_eq!(f.client.list_stream_calls().len(), 2);
        let tokens: Vec<Option<String>> = f.client.put_calls().into_iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec![Some("stale".to_string()), Some("fresh".to_string())]);
        assert_eq!(f.cache.get(&key()).await.as_deref(), Some("next"));
        assert_eq!(f.clock.sleeps(), vec![constants::TOKEN_RESYNC_PAUSE]);
    }

    #[tokio::test]
    async fn test_token_resync_cap_returns_conflict() {
        let client = existing_stream(Some("t"));
        for _ in 0..3 {
            client.push_put_result(Err(RemoteError::TokenConflict {
                expected: None,
                message: "already accepted".into(),
            }));
        }
        let f = fixture(
            client,
            false,
            RetryPolicy {
                max_token_resyncs: Some(2),
                ..RetryPolicy::default()
            },
        );

        let result = f.engine.commit(&key(), &batch()).await;
        assert!(matches!(result, Err(RemoteError::TokenConflict { .. })));
        assert_eq!(f.client.put_calls().len(), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_throttling_drops_after_limit_plus_one_attempts() {
        let client = existing_stream(None);
        for _ in 0..4 {
            client.push_put_result(Err(RemoteError::Throttled("Rate exceeded".into())));
        }
        client.push_put_result(Ok(Some("never-used".into())));
        let f = fixture(client, false, fast_policy(Some(3)));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Dropped { attempts: 4 });
        assert_eq!(f.client.put_calls().len(), 4);
        assert!(logs_contain("failed to PutLogEvents and discard logs"));

        let sleeps = f.clock.sleeps();
        assert_eq!(sleeps.len(), 3);
        for (retry, sleep) in sleeps.iter().enumerate() {
            let nominal = 100.0 * 2f64.powi(retry as i32);
            let millis = sleep.as_secs_f64() * 1_000.0;
            assert!(
                millis >= nominal * 0.875 - 1e-6 && millis <= nominal * 1.125 + 1e-6,
                "retry {retry} slept {millis}ms"
            );
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_throttling_then_success_logs_recovery() {
        let client = existing_stream(None);
        client.push_put_result(Err(RemoteError::Throttled("Rate exceeded".into())));
        let f = fixture(client, false, fast_policy(Some(3)));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { attempts: 2 });
        assert!(logs_contain("retry succeeded"));
    }

    #[tokio::test]
    async fn test_unlimited_retries_never_drop() {
        let client = existing_stream(None);
        for _ in 0..25 {
            client.push_put_result(Err(RemoteError::Throttled("Rate exceeded".into())));
        }
        let f = fixture(client, false, fast_policy(None));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { attempts: 26 });
    }

    #[tokio::test]
    async fn test_missing_stream_is_recreated_with_fresh_token() {
        let client = existing_stream(Some("old"));
        client.push_put_result(Err(RemoteError::StreamMissing(
            "The specified log stream does not exist.".into(),
        )));
        let f = fixture(client, true, RetryPolicy::default());

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { attempts: 2 });
        assert_eq!(f.client.created_streams(), vec![key()]);
        let tokens: Vec<Option<String>> = f.client.put_calls().into_iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec![Some("old".to_string()), None]);
    }

    #[tokio::test]
    async fn test_missing_stream_without_auto_create_is_fatal() {
        let client = existing_stream(None);
        client.push_put_result(Err(RemoteError::StreamMissing("gone".into())));
        let f = fixture(client, false, RetryPolicy::default());

        let result = f.engine.commit(&key(), &batch()).await;
        assert_eq!(result, Err(RemoteError::StreamMissing("gone".into())));
    }

    #[tokio::test]
    async fn test_missing_destination_is_skipped() {
        let f = fixture(FakeLogsClient::new(), false, RetryPolicy::default());

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Skipped);
        assert!(f.client.put_calls().is_empty());
    }

    #[tokio::test]
    async fn test_destination_created_after_skip_is_used() {
        let client = FakeLogsClient::new();
        client.add_group("g");
        let f = fixture(client, false, RetryPolicy::default());

        assert_eq!(
            f.engine.commit(&key(), &batch()).await.unwrap(),
            CommitOutcome::Skipped
        );
        f.client.add_stream(&key(), None);

        assert_eq!(
            f.engine.commit(&key(), &batch()).await.unwrap(),
            CommitOutcome::Committed { attempts: 1 }
        );
        assert_eq!(f.client.list_stream_calls().len(), 2);
        assert_eq!(f.client.put_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_throttled_stream_lookup_is_retried() {
        let client = existing_stream(Some("t0"));
        client.push_stream_result("g", Err(RemoteError::Throttled("Rate exceeded".into())));
        let f = fixture(client, false, fast_policy(Some(3)));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { attempts: 1 });
        assert_eq!(f.client.list_stream_calls().len(), 2);
        let calls = f.client.put_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].token.as_deref(), Some("t0"));
        assert_eq!(f.clock.sleeps().len(), 1);
    }

    #[tokio::test]
    async fn test_throttled_resync_is_retried() {
        let client = FakeLogsClient::new();
        client.add_group("g");
        client.add_stream_page("g", vec![("s", Some("stale"))], None);
        client.push_stream_result("g", Err(RemoteError::Throttled("Rate exceeded".into())));
        client.add_stream_page("g", vec![("s", Some("fresh"))], None);
        client.push_put_result(Err(RemoteError::TokenConflict {
            expected: Some("fresh".into()),
            message: "The given sequenceToken is invalid".into(),
        }));
        let f = fixture(client, false, fast_policy(Some(3)));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Committed { attempts: 2 });
        let tokens: Vec<Option<String>> = f.client.put_calls().into_iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec![Some("stale".to_string()), Some("fresh".to_string())]);
        let sleeps = f.clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert_eq!(sleeps[0], constants::TOKEN_RESYNC_PAUSE);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_throttled_lookups_share_retry_limit() {
        let client = existing_stream(None);
        for _ in 0..2 {
            client.push_stream_result("g", Err(RemoteError::Throttled("Rate exceeded".into())));
        }
        let f = fixture(client, false, fast_policy(Some(1)));

        let outcome = f.engine.commit(&key(), &batch()).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Dropped { attempts: 0 });
        assert!(f.client.put_calls().is_empty());
        assert!(logs_contain("failed to look up destination and discard logs"));
    }

    #[tokio::test]
    async fn test_other_errors_are_returned() {
        let client = existing_stream(None);
        let denied = RemoteError::Other {
            code: "AccessDeniedException".into(),
            message: "not authorized".into(),
        };
        client.push_put_result(Err(denied.clone()));
        let f = fixture(client, false, RetryPolicy::default());

        assert_eq!(f.engine.commit(&key(), &batch()).await, Err(denied));
        assert_eq!(f.client.put_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let client = existing_stream(None);
        client.push_put_result(Err(RemoteError::Throttled("Rate exceeded".into())));
        let f = fixture(client, false, fast_policy(Some(5)));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = f.engine.with_cancellation(cancel);

        let outcome = engine.commit(&key(), &batch()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Interrupted);
        assert_eq!(f.client.put_calls().len(), 1);
    }

    #[test]
    fn test_throttle_wait_doubles() {
        let policy = RetryPolicy {
            base_wait: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        let wait = policy.throttle_wait(4).as_secs_f64();
        assert!((14.0..=18.0).contains(&wait));
        assert!(policy.throttle_wait(10_000) > Duration::from_secs(1_000_000));
    }
}
