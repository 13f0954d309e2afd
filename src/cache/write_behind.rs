//! Queued write-through.
//!
//! The store processor hands writes to a background task and answers the
//! caller right away. The task flushes in arrival order whenever a batch
//! fills up or the flush interval elapses, so a remove never overtakes an
//! earlier store of the same key.

use crate::cache::extensions::{DataStore, Storable};
use crate::metrics::CacheMetrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A write waiting to reach the data store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Store(Storable),
    Remove(Bytes),
}

/// Sending side of the queue.
pub struct WriteBehind {
    tx: mpsc::UnboundedSender<WriteOp>,
    task: JoinHandle<()>,
}

impl WriteBehind {
    /// Start the flushing task. It drains what is queued when `cancel` fires.
    pub fn spawn(
        cache: String,
        store: Arc<dyn DataStore>,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Arc<CacheMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let flusher = Flusher {
            cache,
            store,
            batch_size: batch_size.max(1),
            metrics,
            buffer: Vec::new(),
        };
        let task = tokio::spawn(flusher.run(rx, flush_interval, cancel));
        Self { tx, task }
    }

    pub fn enqueue(&self, op: WriteOp) {
        if self.tx.send(op).is_err() {
            warn!("Write-behind queue closed, dropping write");
        }
    }

    /// Close the queue and wait for the final flush.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

struct Flusher {
    cache: String,
    store: Arc<dyn DataStore>,
    batch_size: usize,
    metrics: Arc<CacheMetrics>,
    buffer: Vec<WriteOp>,
}

impl Flusher {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<WriteOp>,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    rx.close();
                    while let Some(op) = rx.recv().await {
                        self.buffer.push(op);
                    }
                    break;
                }
                op = rx.recv() => match op {
                    Some(op) => {
                        self.buffer.push(op);
                        if self.buffer.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = interval.tick() => self.flush().await,
            }
        }

        self.flush().await;
        debug!(cache = %self.cache, "Write-behind queue stopped");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.buffer);
        for run in runs(ops) {
            let result = match &run {
                Run::Store(entries) => self.store.store(entries).await,
                Run::Remove(keys) => self.store.remove(keys).await,
            };
            if let Err(e) = result {
                self.metrics.write_through_failures.inc();
                warn!(cache = %self.cache, writes = run.len(), error = %e, "Queued write-through failed");
            }
        }
    }
}

/// Consecutive writes of the same kind.
#[derive(Debug, PartialEq, Eq)]
enum Run {
    Store(Vec<Storable>),
    Remove(Vec<Bytes>),
}

impl Run {
    fn len(&self) -> usize {
        match self {
            Run::Store(entries) => entries.len(),
            Run::Remove(keys) => keys.len(),
        }
    }
}

fn runs(ops: Vec<WriteOp>) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for op in ops {
        match (runs.last_mut(), op) {
            (Some(Run::Store(entries)), WriteOp::Store(entry)) => entries.push(entry),
            (Some(Run::Remove(keys)), WriteOp::Remove(key)) => keys.push(key),
            (_, WriteOp::Store(entry)) => runs.push(Run::Store(vec![entry])),
            (_, WriteOp::Remove(key)) => runs.push(Run::Remove(vec![key])),
        }
    }
    runs
}
