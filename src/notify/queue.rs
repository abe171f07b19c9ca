use super::{DispatchEngine, DispatchJob};
use crate::stats::IngestStats;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bounded hand-off from the ingest path to the dispatch worker. A full queue drops the job with
/// a warning; the next alerting reading for the device queues a fresh one.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<DispatchJob>,
    stats: Arc<IngestStats>,
}

impl DispatchQueue {
    pub fn channel(
        capacity: usize,
        stats: Arc<IngestStats>,
    ) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, stats }, rx)
    }

    pub fn enqueue(&self, job: DispatchJob) {
        let device_id = job.device_id.clone();
        // Counted before the send so the worker's decrement never runs ahead of it.
        let depth = self.stats.dispatch_queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        match self.tx.try_send(job) {
            Ok(()) => {
                tracing::trace!(device_id = %device_id, depth, "queued dispatch");
            }
            Err(err) => {
                self.stats.dispatch_queue_depth.fetch_sub(1, Ordering::Relaxed);
                IngestStats::incr(&self.stats.dispatch_dropped);
                tracing::warn!(device_id = %device_id, error = %err, "dispatch queue full; dropping alert");
            }
        }
    }
}

pub fn spawn_worker(
    mut rx: mpsc::Receiver<DispatchJob>,
    engine: Arc<DispatchEngine>,
    stats: Arc<IngestStats>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            stats.dispatch_queue_depth.fetch_sub(1, Ordering::Relaxed);
            if let Err(err) = engine.dispatch(&job).await {
                stats.record_error(format!("dispatch for {}: {err:#}", job.device_id));
                tracing::warn!(
                    device_id = %job.device_id,
                    error = %format!("{err:#}"),
                    "dispatch failed; will retry on next alerting reading"
                );
            }
        }
        tracing::info!("dispatch queue closed");
    })
}
