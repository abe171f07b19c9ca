use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Process-wide counters shared by the receiver, the dispatch worker and the jobs.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub packets_received: AtomicU64,
    pub packets_rejected: AtomicU64,
    pub readings_stored: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_suppressed: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub dispatch_queue_depth: AtomicU64,
    pub dispatch_dropped: AtomicU64,
    pub buckets_written: AtomicU64,
    pub readings_purged: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_rejected: u64,
    pub readings_stored: u64,
    pub notifications_sent: u64,
    pub notifications_suppressed: u64,
    pub notifications_failed: u64,
    pub dispatch_queue_depth: u64,
    pub dispatch_dropped: u64,
    pub buckets_written: u64,
    pub readings_purged: u64,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            packets_received: load(&self.packets_received),
            packets_rejected: load(&self.packets_rejected),
            readings_stored: load(&self.readings_stored),
            notifications_sent: load(&self.notifications_sent),
            notifications_suppressed: load(&self.notifications_suppressed),
            notifications_failed: load(&self.notifications_failed),
            dispatch_queue_depth: load(&self.dispatch_queue_depth),
            dispatch_dropped: load(&self.dispatch_dropped),
            buckets_written: load(&self.buckets_written),
            readings_purged: load(&self.readings_purged),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}
