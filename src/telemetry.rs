use crate::types::GpsFix;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::borrow::Cow;
use thiserror::Error;

/// A decoded anemometer datagram, before any device lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPacket {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub wind_speed: f64,
    pub gps: Option<GpsFix>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("missing required field {0}")]
    MissingField(&'static str),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("invalid wind speed")]
    InvalidWindSpeed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BorrowedPacket<'a> {
    #[serde(default, borrow)]
    device_id: Option<Cow<'a, str>>,
    #[serde(default, borrow)]
    timestamp: Option<BorrowedTimestamp<'a>>,
    #[serde(default, borrow)]
    wind_speed: Option<BorrowedNumber<'a>>,
    #[serde(default, borrow)]
    gps: Option<Cow<'a, str>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedTimestamp<'a> {
    Int(i64),
    Float(f64),
    #[serde(borrow)]
    Str(Cow<'a, str>),
}

/// Some firmware sends the speed as a quoted decimal.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BorrowedNumber<'a> {
    Num(f64),
    #[serde(borrow)]
    Str(Cow<'a, str>),
}

impl BorrowedNumber<'_> {
    fn to_f64(&self) -> Option<f64> {
        match self {
            BorrowedNumber::Num(value) => Some(*value),
            BorrowedNumber::Str(raw) => raw.trim().parse::<f64>().ok(),
        }
    }
}

pub fn decode(bytes: &[u8]) -> Result<TelemetryPacket, DecodeError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;

    let mut buffer = bytes.to_vec();
    let packet: BorrowedPacket = simd_json::serde::from_slice(&mut buffer)
        .map_err(|err| DecodeError::InvalidJson(err.to_string()))?;

    let device_id = packet
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or(DecodeError::MissingField("deviceId"))?
        .to_string();

    let timestamp = match packet.timestamp {
        Some(BorrowedTimestamp::Int(ms)) => millis_to_dt(ms)?,
        Some(BorrowedTimestamp::Float(ms)) => millis_to_dt(ms as i64)?,
        Some(BorrowedTimestamp::Str(raw)) => parse_timestamp(&raw)?,
        None => return Err(DecodeError::MissingField("timestamp")),
    };

    let wind_speed = packet
        .wind_speed
        .ok_or(DecodeError::MissingField("windSpeed"))?
        .to_f64()
        .filter(|speed| speed.is_finite() && *speed >= 0.0)
        .ok_or(DecodeError::InvalidWindSpeed)?;

    let gps = match packet.gps.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => {
            let fix = parse_gps(raw);
            if fix.is_none() {
                tracing::debug!(device_id = %device_id, gps = raw, "ignoring unparsable gps");
            }
            fix
        }
    };

    Ok(TelemetryPacket {
        device_id,
        timestamp,
        wind_speed,
        gps,
    })
}

/// Parses `"lat,lng"`; out-of-range coordinates are rejected.
pub fn parse_gps(raw: &str) -> Option<GpsFix> {
    let (lat, lng) = raw.split_once(',')?;
    let latitude = lat.trim().parse::<f64>().ok()?;
    let longitude = lng.trim().parse::<f64>().ok()?;
    if !latitude.is_finite() || !longitude.is_finite() {
        return None;
    }
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }
    Some(GpsFix {
        latitude,
        longitude,
    })
}

/// ISO-8601 with an offset, or a naive local-less timestamp taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(DecodeError::InvalidTimestamp(trimmed.to_string()))
}

fn millis_to_dt(ms: i64) -> Result<DateTime<Utc>, DecodeError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| DecodeError::InvalidTimestamp(ms.to_string()))
}
