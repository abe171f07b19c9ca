//! "Current gauge" readout for dashboards.
//!
//! The gauge is a trailing average over a short window. Alerting and downtime keep using the
//! instantaneous reading, so both values are reported side by side and never substituted for
//! one another.

use crate::schedule::Clock;
use crate::store::ReadingRepository;
use crate::types::WindReading;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaugeReading {
    pub device_id: String,
    pub instantaneous_wind_speed: Option<f64>,
    pub instantaneous_at: Option<DateTime<Utc>>,
    pub trailing_average: Option<f64>,
    pub trailing_window_seconds: i64,
    pub trailing_samples: usize,
}

/// Mean of samples with `now - window < timestamp <= now`.
pub fn trailing_average(samples: &[WindReading], now: DateTime<Utc>, window: Duration) -> Option<(f64, usize)> {
    let window_start = now - window;
    let (total, count) = samples
        .iter()
        .filter(|s| s.timestamp > window_start && s.timestamp <= now)
        .fold((0.0, 0usize), |(total, count), s| (total + s.wind_speed, count + 1));
    (count > 0).then(|| (total / count as f64, count))
}

pub struct GaugeService {
    readings: Arc<dyn ReadingRepository>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl GaugeService {
    pub fn new(readings: Arc<dyn ReadingRepository>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            readings,
            clock,
            window,
        }
    }

    pub async fn current(&self, device_id: &str) -> Result<GaugeReading> {
        let now = self.clock.now();
        let latest = self.readings.latest_reading(device_id).await?;
        let recent = self
            .readings
            .readings_since(device_id, now - self.window)
            .await?;
        let trailing = trailing_average(&recent, now, self.window);

        Ok(GaugeReading {
            device_id: device_id.to_string(),
            instantaneous_wind_speed: latest.as_ref().map(|r| r.wind_speed),
            instantaneous_at: latest.as_ref().map(|r| r.timestamp),
            trailing_average: trailing.map(|(avg, _)| avg),
            trailing_window_seconds: self.window.num_seconds(),
            trailing_samples: trailing.map(|(_, count)| count).unwrap_or(0),
        })
    }
}
