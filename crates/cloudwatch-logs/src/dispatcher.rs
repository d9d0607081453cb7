// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fans pending records out to the commit engine.
//!
//! Records are grouped by destination. Each destination is committed by its
//! own task, which first takes the destination's lease (so commits to one
//! stream never overlap) and then a permit from the shared pool (so at most
//! `concurrency` streams are written at once).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::batch::{build_batches, BatchLimits};
use crate::commit::{CommitEngine, CommitOutcome};
use crate::errors::RemoteError;
use crate::model::{PendingRecord, StreamKey};

/// One exclusive lease per stream, created on first use.
///
/// Leases nobody holds or waits for are dropped on the next acquire, so the
/// map only tracks destinations with a commit in progress.
#[derive(Debug, Default)]
pub struct KeyedLeases {
    leases: Mutex<HashMap<StreamKey, Arc<AsyncMutex<()>>>>,
}

impl KeyedLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no one else holds the lease for `key`.
    pub async fn acquire(&self, key: &StreamKey) -> OwnedMutexGuard<()> {
        let lease = {
            let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
            // Holders and waiters keep a clone; the map's own reference is the last one.
            leases.retain(|held, lease| held == key || Arc::strong_count(lease) > 1);
            leases.entry(key.clone()).or_default().clone()
        };
        lease.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Record counts of one dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub committed: usize,
    pub skipped: usize,
    pub dropped: usize,
    pub interrupted: usize,
    /// Destinations whose commit failed; their remaining batches were not sent.
    pub failed: Vec<(StreamKey, RemoteError)>,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.committed += other.committed;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
        self.interrupted += other.interrupted;
        self.failed.extend(other.failed);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<CommitEngine>,
    leases: Arc<KeyedLeases>,
    permits: Arc<Semaphore>,
    limits: BatchLimits,
}

impl Dispatcher {
    pub fn new(engine: Arc<CommitEngine>, concurrency: usize, limits: BatchLimits) -> Self {
        Self {
            engine,
            leases: Arc::new(KeyedLeases::new()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            limits,
        }
    }

    pub async fn dispatch(&self, records: Vec<(StreamKey, PendingRecord)>) -> DispatchReport {
        let mut by_key: BTreeMap<StreamKey, Vec<PendingRecord>> = BTreeMap::new();
        for (key, record) in records {
            by_key.entry(key).or_default().push(record);
        }

        let mut tasks = JoinSet::new();
        for (key, records) in by_key {
            let dispatcher = self.clone();
            tasks.spawn(async move { dispatcher.commit_stream(key, records).await });
        }

        let mut report = DispatchReport::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(stream_report) => report.merge(stream_report),
                Err(err) => error!("commit task failed: {err}"),
            }
        }
        report
    }

    async fn commit_stream(&self, key: StreamKey, records: Vec<PendingRecord>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let _lease = self.leases.acquire(&key).await;
        let Ok(_permit) = self.permits.acquire().await else {
            warn!(group = %key.group, stream = %key.stream, "commit pool closed");
            return report;
        };

        let batches = build_batches(records, &self.limits);
        debug!(group = %key.group, stream = %key.stream, batches = batches.len(), "committing");
        for batch in batches {
            match self.engine.commit(&key, &batch).await {
                Ok(CommitOutcome::Committed { .. }) => report.committed += batch.len(),
                Ok(CommitOutcome::Skipped) => report.skipped += batch.len(),
                Ok(CommitOutcome::Dropped { .. }) => report.dropped += batch.len(),
                Ok(CommitOutcome::Interrupted) => {
                    report.interrupted += batch.len();
                    break;
                }
                Err(err) => {
                    error!(
                        group = %key.group,
                        stream = %key.stream,
                        error = %err,
                        "commit failed, abandoning remaining batches for this stream"
                    );
                    report.failed.push((key.clone(), err));
                    break;
                }
            }
        }
        report
    }
}
