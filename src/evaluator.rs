use crate::notify::{DispatchJob, DispatchQueue};
use crate::stats::IngestStats;
use crate::store::ReadingRepository;
use crate::telemetry::TelemetryPacket;
use crate::types::{AlertLevel, Device, GpsFix, NewWindReading, Thresholds, WindReading};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Whether an accepted reading may reach contacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Live,
    /// Stored and evaluated like a live reading, but never dispatched.
    Simulation,
}

/// Derives alert flags and incremental downtime for one reading.
///
/// Downtime is only attributed when both this reading and the previously stored one are red, and
/// is the gap between their timestamps. A previous reading with a later timestamp (out-of-order
/// arrival) contributes zero.
pub fn evaluate(
    device_id: &str,
    timestamp: DateTime<Utc>,
    wind_speed: f64,
    location: Option<GpsFix>,
    thresholds: Thresholds,
    previous: Option<&WindReading>,
) -> NewWindReading {
    let amber_alert = wind_speed >= thresholds.amber;
    let red_alert = wind_speed >= thresholds.red;

    let downtime_seconds = match previous {
        Some(prev) if red_alert && prev.red_alert => {
            let delta_ms = (timestamp - prev.timestamp).num_milliseconds();
            (delta_ms.max(0) as f64) / 1000.0
        }
        _ => 0.0,
    };

    NewWindReading {
        device_id: device_id.to_string(),
        timestamp,
        wind_speed,
        location,
        amber_alert,
        red_alert,
        alert_state: amber_alert,
        downtime_seconds,
    }
}

#[derive(Clone)]
pub struct Evaluator {
    readings: Arc<dyn ReadingRepository>,
    dispatch: DispatchQueue,
    stats: Arc<IngestStats>,
}

impl Evaluator {
    pub fn new(
        readings: Arc<dyn ReadingRepository>,
        dispatch: DispatchQueue,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            readings,
            dispatch,
            stats,
        }
    }

    /// Persists the decorated reading, then queues dispatch for amber or red readings. Queueing
    /// never waits on the email transport.
    pub async fn ingest(
        &self,
        device: &Device,
        thresholds: Thresholds,
        packet: &TelemetryPacket,
        mode: IngestMode,
    ) -> Result<WindReading> {
        let previous = self.readings.latest_reading(&device.id).await?;
        let decorated = evaluate(
            &device.id,
            packet.timestamp,
            packet.wind_speed,
            packet.gps,
            thresholds,
            previous.as_ref(),
        );
        let stored = self.readings.insert_reading(&decorated).await?;
        IngestStats::incr(&self.stats.readings_stored);

        let level = stored.alert_level();
        tracing::debug!(
            device_id = %device.id,
            wind_speed = stored.wind_speed,
            level = %level,
            downtime_seconds = stored.downtime_seconds,
            "reading stored"
        );

        if level != AlertLevel::Normal {
            match mode {
                IngestMode::Live => self.dispatch.enqueue(DispatchJob {
                    device_id: device.id.clone(),
                    device_name: device.name.clone(),
                    place_name: device.place_name.clone(),
                    level,
                    wind_speed: stored.wind_speed,
                    observed_at: stored.timestamp,
                }),
                IngestMode::Simulation => {
                    tracing::info!(device_id = %device.id, level = %level, "simulated alert; dispatch skipped")
                }
            }
        }

        Ok(stored)
    }
}
