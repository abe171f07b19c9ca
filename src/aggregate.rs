use crate::error::AggregationError;
use crate::schedule::{align_down, Job};
use crate::stats::IngestStats;
use crate::store::{BucketWrite, ReadingRepository};
use crate::types::{HistoricalBucket, WindReading};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct AggregationSettings {
    pub bucket_width: Duration,
    pub safety_buffer: Duration,
    pub retention: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationReport {
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub buckets_written: u64,
    pub buckets_skipped: u64,
    pub readings_purged: u64,
}

/// `[start, end)` for this tick, or `None` when nothing new has settled.
pub fn aggregation_window(
    now: DateTime<Utc>,
    last_bucket_end: Option<DateTime<Utc>>,
    settings: &AggregationSettings,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start = last_bucket_end
        .unwrap_or_else(|| align_down(now - settings.retention, settings.bucket_width));
    let end = align_down(now - settings.safety_buffer, settings.bucket_width);
    (start < end).then_some((start, end))
}

/// Summary statistics for one sub-interval. Standard deviation is the population value.
pub fn bucket_stats(
    device_id: &str,
    interval_start: DateTime<Utc>,
    interval_end: DateTime<Utc>,
    readings: &[&WindReading],
) -> Option<HistoricalBucket> {
    if readings.is_empty() {
        return None;
    }
    let count = readings.len() as f64;
    let avg = readings.iter().map(|r| r.wind_speed).sum::<f64>() / count;
    let max = readings
        .iter()
        .map(|r| r.wind_speed)
        .fold(f64::NEG_INFINITY, f64::max);
    let variance = readings
        .iter()
        .map(|r| (r.wind_speed - avg).powi(2))
        .sum::<f64>()
        / count;

    Some(HistoricalBucket {
        device_id: device_id.to_string(),
        interval_start,
        interval_end,
        avg_wind_speed: avg,
        max_wind_speed: max,
        std_deviation: variance.sqrt(),
        alert_triggered: readings.iter().any(|r| r.alert_state),
        amber_alert_triggered: readings.iter().any(|r| r.amber_alert),
        red_alert_triggered: readings.iter().any(|r| r.red_alert),
        downtime_seconds: readings.iter().map(|r| r.downtime_seconds).sum(),
        sample_count: readings.len() as i32,
    })
}

pub struct AggregationJob {
    readings: Arc<dyn ReadingRepository>,
    settings: AggregationSettings,
    stats: Arc<IngestStats>,
}

impl AggregationJob {
    pub fn new(
        readings: Arc<dyn ReadingRepository>,
        settings: AggregationSettings,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            readings,
            settings,
            stats,
        }
    }

    pub async fn run_tick(&self, now: DateTime<Utc>) -> Result<AggregationReport, AggregationError> {
        let mut report = AggregationReport::default();

        let last_end = self.readings.last_bucket_end().await?;
        if let Some((start, end)) = aggregation_window(now, last_end, &self.settings) {
            report.window = Some((start, end));
            for device_id in self.readings.devices_with_unprocessed(start, end).await? {
                let (written, skipped) = self.aggregate_device(&device_id, start, end).await?;
                report.buckets_written += written;
                report.buckets_skipped += skipped;
            }
            tracing::info!(
                window_start = %start,
                window_end = %end,
                written = report.buckets_written,
                skipped = report.buckets_skipped,
                "aggregation window complete"
            );
        } else {
            tracing::debug!(last_end = ?last_end, "no settled interval to aggregate");
        }
        IngestStats::add(&self.stats.buckets_written, report.buckets_written);

        report.readings_purged = self.sweep_retention(now).await?;
        Ok(report)
    }

    async fn aggregate_device(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(u64, u64), AggregationError> {
        let readings = self
            .readings
            .unprocessed_readings(device_id, start, end)
            .await?;

        let width_ms = self.settings.bucket_width.num_milliseconds().max(1);
        let mut groups: BTreeMap<i64, Vec<&WindReading>> = BTreeMap::new();
        for reading in &readings {
            let offset_ms = (reading.timestamp - start).num_milliseconds();
            groups
                .entry(offset_ms.div_euclid(width_ms))
                .or_default()
                .push(reading);
        }

        let (mut written, mut skipped) = (0, 0);
        for (index, group) in groups {
            let interval_start = start + Duration::milliseconds(index * width_ms);
            let interval_end = interval_start + self.settings.bucket_width;
            let Some(bucket) = bucket_stats(device_id, interval_start, interval_end, &group) else {
                continue;
            };
            let ids: Vec<i64> = group.iter().map(|r| r.id).collect();
            match self.readings.write_bucket(&bucket, &ids).await? {
                BucketWrite::Written => written += 1,
                BucketWrite::Skipped => {
                    tracing::warn!(
                        device_id,
                        interval_start = %interval_start,
                        "bucket already produced by another worker; skipped"
                    );
                    skipped += 1;
                }
            }
        }
        Ok((written, skipped))
    }

    /// Purges settled readings past retention, then fails the tick if any unprocessed reading is
    /// still older than the cutoff.
    async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<u64, AggregationError> {
        let cutoff = now - self.settings.retention;
        let purged = self.readings.purge_processed_before(cutoff).await?;
        IngestStats::add(&self.stats.readings_purged, purged);
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "retention sweep removed readings");
        }

        let stale = self.readings.count_unprocessed_before(cutoff).await?;
        if stale > 0 {
            tracing::error!(
                count = stale,
                cutoff = %cutoff,
                "unprocessed readings past retention; aggregation is falling behind"
            );
            self.stats
                .record_error(format!("{stale} unprocessed readings older than {cutoff}"));
            return Err(AggregationError::StaleUnprocessed {
                count: stale,
                cutoff,
            });
        }
        Ok(purged)
    }
}

#[async_trait]
impl Job for AggregationJob {
    fn name(&self) -> &'static str {
        "wind-aggregation"
    }

    async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.run_tick(now).await?;
        Ok(())
    }
}
