use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Normal,
    Amber,
    Red,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Amber => "amber",
            Self::Red => "red",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "normal" => Some(Self::Normal),
            "amber" => Some(Self::Amber),
            "red" => Some(Self::Red),
            _ => None,
        }
    }

    pub fn from_flags(amber_alert: bool, red_alert: bool) -> Self {
        if red_alert {
            Self::Red
        } else if amber_alert {
            Self::Amber
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub place_name: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn location(&self) -> Option<GpsFix> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GpsFix {
                latitude,
                longitude,
            }),
            _ => None,
        }
    }
}

/// Per-device alert thresholds. `amber <= red` is enforced by whoever writes them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub amber: f64,
    pub red: f64,
}

/// Heartbeat written on every accepted packet. Location and place name only fill empty columns.
#[derive(Debug, Clone)]
pub struct HeartbeatUpdate {
    pub seen_at: DateTime<Utc>,
    pub location: Option<GpsFix>,
    pub place_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WindReading {
    pub id: i64,
    pub device_id: String,
    #[sqlx(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub wind_speed: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub amber_alert: bool,
    pub red_alert: bool,
    pub alert_state: bool,
    pub downtime_seconds: f64,
    pub processed: bool,
}

impl WindReading {
    pub fn alert_level(&self) -> AlertLevel {
        AlertLevel::from_flags(self.amber_alert, self.red_alert)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewWindReading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub wind_speed: f64,
    pub location: Option<GpsFix>,
    pub amber_alert: bool,
    pub red_alert: bool,
    pub alert_state: bool,
    pub downtime_seconds: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalBucket {
    pub device_id: String,
    pub interval_start: DateTime<Utc>,
    pub interval_end: DateTime<Utc>,
    pub avg_wind_speed: f64,
    pub max_wind_speed: f64,
    pub std_deviation: f64,
    pub alert_triggered: bool,
    pub amber_alert_triggered: bool,
    pub red_alert_triggered: bool,
    pub downtime_seconds: f64,
    pub sample_count: i32,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Contact {
    pub id: i64,
    pub device_id: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRecord {
    pub id: i64,
    pub device_id: String,
    pub contact_id: i64,
    pub alert_level: AlertLevel,
    pub wind_speed: f64,
    pub sent_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub device_id: String,
    pub contact_id: i64,
    pub alert_level: AlertLevel,
    pub wind_speed: f64,
    pub sent_at: DateTime<Utc>,
}

/// What a token authorises when it is redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenAction {
    Acknowledge,
    SnoozeHours(u32),
    SnoozeToday,
}

impl TokenAction {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        match value.as_str() {
            "acknowledge" => return Some(Self::Acknowledge),
            "snooze_today" => return Some(Self::SnoozeToday),
            _ => {}
        }
        let hours = value.strip_prefix("snooze_")?.strip_suffix('h')?;
        match hours.parse::<u32>() {
            Ok(hours) if hours > 0 => Some(Self::SnoozeHours(hours)),
            _ => None,
        }
    }

    pub fn is_snooze(self) -> bool {
        !matches!(self, Self::Acknowledge)
    }
}

impl fmt::Display for TokenAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledge => f.write_str("acknowledge"),
            Self::SnoozeHours(hours) => write!(f, "snooze_{hours}h"),
            Self::SnoozeToday => f.write_str("snooze_today"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationToken {
    pub id: Uuid,
    pub device_id: String,
    pub contact_id: i64,
    pub action: TokenAction,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl NotificationToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Snooze {
    pub device_id: String,
    pub contact_id: i64,
    pub snoozed_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Snooze {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.snoozed_until > now
    }
}

/// A successful token redemption, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Redemption {
    pub token_id: Uuid,
    pub device_id: String,
    pub contact_id: i64,
    pub action: TokenAction,
    pub redeemed_at: DateTime<Utc>,
    pub snoozed_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnsubscribeOutcome {
    pub contact_removed: bool,
    pub history_archived: u64,
    pub tokens_removed: u64,
    pub snoozes_removed: u64,
}
