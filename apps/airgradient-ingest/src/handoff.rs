use crate::point::Point;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
#[error("handoff queue closed")]
pub struct HandoffClosed;

/// Counters shared by the HTTP handlers, the batch writer and the error drain.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub queue_depth: AtomicU64,
    pub accepted: AtomicU64,
    pub written: AtomicU64,
    pub write_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub queue_depth: u64,
    pub accepted: u64,
    pub written: u64,
    pub write_errors: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Producer side, cloned into every request handler.
#[derive(Clone)]
pub struct HandoffSender {
    tx: mpsc::Sender<Point>,
    stats: Arc<PipelineStats>,
}

/// Consumer side. Not `Clone`: exactly one batch writer drains the queue.
pub struct HandoffReceiver {
    rx: mpsc::Receiver<Point>,
    stats: Arc<PipelineStats>,
}

/// Creates the bounded queue between ingress and the batch writer.
pub fn channel(capacity: usize, stats: Arc<PipelineStats>) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        HandoffSender {
            tx,
            stats: stats.clone(),
        },
        HandoffReceiver { rx, stats },
    )
}

impl HandoffSender {
    /// Waits for a free slot when the queue is full; there is no drop policy.
    ///
    /// Cancel-safe: a caller dropped while waiting leaves the queue and its
    /// counters untouched.
    pub async fn send(&self, point: Point) -> Result<(), HandoffClosed> {
        let permit = self.tx.reserve().await.map_err(|_| HandoffClosed)?;
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, sensor = %point.sensor_id, "queued point");
        permit.send(point);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }
}

impl HandoffReceiver {
    /// `None` once every sender is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Point> {
        let point = self.rx.recv().await?;
        self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
        Some(point)
    }
}
