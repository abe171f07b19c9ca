//! Wall-clock aligned background jobs.
//!
//! A [`Schedule`] fires on every `period` boundary shifted by `offset` (the aggregation job runs at
//! :03, :13, :23 with the defaults). [`Scheduler::every`] runs one job at a time per schedule, so a
//! slow run delays the next boundary instead of overlapping it. Time comes from an injected
//! [`Clock`], which lets job logic be driven by a manual clock in tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<()>;
}

pub fn align_down(ts: DateTime<Utc>, width: ChronoDuration) -> DateTime<Utc> {
    let width_ms = width.num_milliseconds().max(1);
    let ts_ms = ts.timestamp_millis();
    let bucket_ms = ts_ms.div_euclid(width_ms) * width_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    period: ChronoDuration,
    offset: ChronoDuration,
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self::aligned(period, Duration::ZERO)
    }

    /// Offsets larger than the period wrap around it.
    pub fn aligned(period: Duration, offset: Duration) -> Self {
        let period_ms = (period.as_millis() as i64).max(1);
        let offset_ms = (offset.as_millis() as i64) % period_ms;
        Self {
            period: ChronoDuration::milliseconds(period_ms),
            offset: ChronoDuration::milliseconds(offset_ms),
        }
    }

    pub fn period(&self) -> ChronoDuration {
        self.period
    }

    /// First boundary strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let last = align_down(now - self.offset, self.period) + self.offset;
        last + self.period
    }
}

#[derive(Clone)]
pub struct Scheduler {
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub async fn run_now(&self, job: &dyn Job) -> anyhow::Result<()> {
        let now = self.clock.now();
        tracing::info!(job = job.name(), now = %now, "running job");
        job.run(now).await
    }

    pub fn every(
        &self,
        job: Arc<dyn Job>,
        schedule: Schedule,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let clock = self.clock.clone();
        tokio::spawn(async move {
            tracing::info!(
                job = job.name(),
                period_secs = schedule.period().num_seconds(),
                "job scheduled"
            );
            loop {
                let now = clock.now();
                let next = schedule.next_run_after(now);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let started = clock.now();
                match job.run(started).await {
                    Ok(()) => tracing::debug!(job = job.name(), "job finished"),
                    Err(err) => {
                        tracing::error!(job = job.name(), error = %format!("{err:#}"), "job failed")
                    }
                }
            }
            tracing::info!(job = job.name(), "job stopped");
        })
    }
}
