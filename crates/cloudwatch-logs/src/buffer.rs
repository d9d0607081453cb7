// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor-based queue of records waiting to be committed.
//!
//! Producers hold cloneable [`BufferHandle`]s and push records through an
//! unbounded channel; a single [`BufferService`] task owns the queue, so no
//! lock is needed. The flusher drains everything at once and hands it to
//! the dispatcher.
//!
//! When the queue reaches its capacity the oldest record is evicted with a
//! warning, so a stalled destination cannot grow memory without bound.

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::constants;
use crate::model::{PendingRecord, StreamKey};

pub type Entry = (StreamKey, PendingRecord);

#[derive(Debug)]
pub enum BufferCommand {
    InsertBatch(Vec<Entry>),
    Drain(oneshot::Sender<Vec<Entry>>),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct BufferHandle {
    tx: mpsc::UnboundedSender<BufferCommand>,
}

impl BufferHandle {
    pub fn insert_batch(
        &self,
        entries: Vec<Entry>,
    ) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::InsertBatch(entries))
    }

    /// Takes every queued record, oldest first.
    pub async fn drain(&self) -> Result<Vec<Entry>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::Drain(response_tx))
            .map_err(|e| format!("Failed to send drain command: {e}"))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive drain response: {e}"))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::Shutdown)
    }
}

pub struct BufferService {
    queue: VecDeque<Entry>,
    capacity: usize,
    rx: mpsc::UnboundedReceiver<BufferCommand>,
}

impl BufferService {
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> (Self, BufferHandle) {
        Self::new(constants::DEFAULT_BUFFER_CAPACITY)
    }

    #[must_use]
    pub fn new(capacity: usize) -> (Self, BufferHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            rx,
        };
        (service, BufferHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Record buffer service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                BufferCommand::InsertBatch(entries) => self.insert(entries),
                BufferCommand::Drain(response_tx) => {
                    let entries: Vec<Entry> = self.queue.drain(..).collect();
                    if response_tx.send(entries).is_err() {
                        error!("Failed to send buffer drain response - receiver dropped");
                    }
                }
                BufferCommand::Shutdown => {
                    debug!("Record buffer service shutting down");
                    break;
                }
            }
        }
    }

    fn insert(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if self.queue.len() >= self.capacity {
                self.queue.pop_front();
                warn!(
                    "Record buffer full ({} items), dropping oldest record",
                    self.capacity
                );
            }
            self.queue.push_back(entry);
        }
    }
}
