use anyhow::{Context, Result};
use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub run_migrations: bool,
    pub udp_port: u16,
    pub http_bind: String,
    pub http_timeout_ms: u64,
    pub public_base_url: String,
    pub email_api_url: String,
    pub email_api_key: Option<String>,
    pub email_from: String,
    pub cooldown_minutes: u64,
    pub token_ttl_minutes: u64,
    pub snooze_hours: Vec<u32>,
    pub timezone: Tz,
    pub aggregation_interval_minutes: u64,
    pub aggregation_offset_minutes: u64,
    pub safety_buffer_minutes: u64,
    pub retention_minutes: u64,
    pub cleanup_interval_minutes: u64,
    pub dispatch_queue: usize,
    pub gauge_window_seconds: u64,
    pub geocoder_url: Option<String>,
    pub otlp_endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    public_base_url: Option<String>,
    #[serde(default)]
    email_api_key: Option<String>,
    #[serde(default)]
    email_from: Option<String>,
    #[serde(default)]
    cooldown_minutes: Option<u64>,
    #[serde(default)]
    snooze_hours: Option<Vec<u32>>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    retention_minutes: Option<u64>,
    #[serde(default)]
    geocoder_url: Option<String>,
}

fn load_overrides() -> Option<ConfigOverrides> {
    let path = env_optional_string("WIND_CONFIG_PATH").map(PathBuf::from)?;
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config overrides; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse config overrides; using env defaults"
            );
            None
        }
    }
}

/// File values only fill keys the environment left unset.
fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    let env_allows = |key: &str| env_optional_string(key).is_none();
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_allows("WIND_PUBLIC_BASE_URL") {
        if let Some(url) = non_empty(&overrides.public_base_url) {
            config.public_base_url = url;
        }
    }
    if env_allows("WIND_EMAIL_API_KEY") {
        if let Some(key) = non_empty(&overrides.email_api_key) {
            config.email_api_key = Some(key);
        }
    }
    if env_allows("WIND_EMAIL_FROM") {
        if let Some(from) = non_empty(&overrides.email_from) {
            config.email_from = from;
        }
    }
    if env_allows("WIND_COOLDOWN_MINUTES") {
        if let Some(value) = overrides.cooldown_minutes.filter(|v| *v != 0) {
            config.cooldown_minutes = value;
        }
    }
    if env_allows("WIND_SNOOZE_HOURS") {
        if let Some(hours) = overrides.snooze_hours.as_ref() {
            let hours: Vec<u32> = hours.iter().copied().filter(|h| *h > 0).collect();
            if !hours.is_empty() {
                config.snooze_hours = hours;
            }
        }
    }
    if env_allows("WIND_TIMEZONE") {
        if let Some(tz) = non_empty(&overrides.timezone).and_then(|name| name.parse::<Tz>().ok()) {
            config.timezone = tz;
        }
    }
    if env_allows("WIND_RETENTION_MINUTES") {
        if let Some(value) = overrides.retention_minutes.filter(|v| *v != 0) {
            config.retention_minutes = value;
        }
    }
    if env_allows("WIND_GEOCODER_URL") {
        if let Some(url) = non_empty(&overrides.geocoder_url) {
            config.geocoder_url = Some(url);
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let overrides = load_overrides();

        let database_url = env_optional_string("WIND_DATABASE_URL")
            .or_else(|| env_optional_string("DATABASE_URL"))
            .or_else(|| {
                overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
            .context("WIND_DATABASE_URL or DATABASE_URL is required (or database_url in WIND_CONFIG_PATH)")?;

        let mut config = Self {
            database_url: normalize_database_url(database_url),
            db_pool_size: env_u32("WIND_DB_POOL_SIZE", 10),
            run_migrations: env_bool("WIND_RUN_MIGRATIONS", false),
            udp_port: env_u16("WIND_UDP_PORT", 8125),
            http_bind: env_string("WIND_HTTP_BIND", "0.0.0.0:8080"),
            http_timeout_ms: env_u64("WIND_HTTP_TIMEOUT_MS", 5_000),
            public_base_url: env_string("WIND_PUBLIC_BASE_URL", "http://localhost:8080"),
            email_api_url: env_string(
                "WIND_EMAIL_API_URL",
                "https://api.sendgrid.com/v3/mail/send",
            ),
            email_api_key: env_optional_string("WIND_EMAIL_API_KEY"),
            email_from: env_string("WIND_EMAIL_FROM", "alerts@localhost"),
            cooldown_minutes: env_u64("WIND_COOLDOWN_MINUTES", 15),
            token_ttl_minutes: env_u64("WIND_TOKEN_TTL_MINUTES", 60).max(1),
            snooze_hours: parse_snooze_hours(&env_string("WIND_SNOOZE_HOURS", "1,3")),
            timezone: resolve_timezone(env_optional_string("WIND_TIMEZONE").as_deref()),
            aggregation_interval_minutes: env_u64("WIND_AGGREGATION_INTERVAL_MINUTES", 10).max(1),
            aggregation_offset_minutes: env_u64("WIND_AGGREGATION_OFFSET_MINUTES", 3),
            safety_buffer_minutes: env_u64("WIND_SAFETY_BUFFER_MINUTES", 10),
            retention_minutes: env_u64("WIND_RETENTION_MINUTES", 180).max(1),
            cleanup_interval_minutes: env_u64("WIND_CLEANUP_INTERVAL_MINUTES", 60).max(1),
            dispatch_queue: env_u64("WIND_DISPATCH_QUEUE", 256).max(1) as usize,
            gauge_window_seconds: env_u64("WIND_GAUGE_WINDOW_SECONDS", 30).max(1),
            geocoder_url: env_optional_string("WIND_GEOCODER_URL"),
            otlp_endpoint: env_optional_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = overrides.as_ref() {
            apply_overrides(&mut config, overrides);
        }

        Ok(config)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes as i64)
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_ttl_minutes as i64)
    }

    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_minutes * 60)
    }

    pub fn aggregation_offset(&self) -> Duration {
        Duration::from_secs(self.aggregation_offset_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }

    pub fn gauge_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.gauge_window_seconds as i64)
    }
}

/// Comma-separated hour list; zero and unparsable entries are dropped, duplicates collapse.
pub fn parse_snooze_hours(raw: &str) -> Vec<u32> {
    let mut hours: Vec<u32> = Vec::new();
    for part in raw.split(',') {
        if let Ok(value) = part.trim().parse::<u32>() {
            if value > 0 && !hours.contains(&value) {
                hours.push(value);
            }
        }
    }
    if hours.is_empty() {
        hours.push(1);
    }
    hours
}

fn resolve_timezone(explicit: Option<&str>) -> Tz {
    if let Some(name) = explicit {
        match name.parse::<Tz>() {
            Ok(tz) => return tz,
            Err(err) => {
                tracing::warn!(timezone = name, error = %err, "invalid WIND_TIMEZONE; falling back");
            }
        }
    }
    iana_time_zone::get_timezone()
        .ok()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).ok().map(|value| value.trim().to_lowercase()) {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snooze_hours_parse_and_dedupe() {
        assert_eq!(parse_snooze_hours("1,3"), vec![1, 3]);
        assert_eq!(parse_snooze_hours(" 3 , 0, x, 3, 6"), vec![3, 6]);
        assert_eq!(parse_snooze_hours(""), vec![1]);
    }

    #[test]
    fn database_url_prefixes_are_normalized() {
        assert_eq!(
            normalize_database_url("postgresql+asyncpg://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
        assert_eq!(
            normalize_database_url("postgres://u@h/db".to_string()),
            "postgres://u@h/db"
        );
    }

    #[test]
    fn explicit_timezone_wins() {
        assert_eq!(resolve_timezone(Some("Europe/London")), chrono_tz::Europe::London);
    }
}
