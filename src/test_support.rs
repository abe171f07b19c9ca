use crate::config::Config;
use crate::error::TransportError;
use crate::evaluator::Evaluator;
use crate::gauge::GaugeService;
use crate::geocode::ReverseGeocoder;
use crate::notify::{DispatchJob, DispatchQueue, DispatchSettings, EmailMessage, EmailTransport};
use crate::receiver::PacketHandler;
use crate::redeem::RedeemService;
use crate::schedule::Clock;
use crate::state::AppState;
use crate::stats::IngestStats;
use crate::store::{BucketWrite, DeviceRepository, NotificationRepository, ReadingRepository};
use crate::types::{
    Contact, Device, GpsFix, HeartbeatUpdate, HistoricalBucket, NewNotification, NewWindReading,
    NotificationRecord, NotificationToken, Redemption, Snooze, Thresholds, TokenAction,
    UnsubscribeOutcome, WindReading,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn test_config() -> Config {
    Config {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        db_pool_size: 2,
        run_migrations: false,
        udp_port: 0,
        http_bind: "127.0.0.1:0".to_string(),
        http_timeout_ms: 5_000,
        public_base_url: "https://alerts.example".to_string(),
        email_api_url: "http://127.0.0.1:9/v3/mail/send".to_string(),
        email_api_key: None,
        email_from: "alerts@example.com".to_string(),
        cooldown_minutes: 15,
        token_ttl_minutes: 60,
        snooze_hours: vec![1, 3],
        timezone: chrono_tz::Europe::London,
        aggregation_interval_minutes: 10,
        aggregation_offset_minutes: 3,
        safety_buffer_minutes: 10,
        retention_minutes: 180,
        cleanup_interval_minutes: 60,
        dispatch_queue: 16,
        gauge_window_seconds: 30,
        geocoder_url: None,
        otlp_endpoint: None,
    }
}

pub fn dispatch_settings() -> DispatchSettings {
    let config = test_config();
    DispatchSettings {
        cooldown: config.cooldown(),
        token_ttl: config.token_ttl(),
        offered_actions: vec![
            TokenAction::Acknowledge,
            TokenAction::SnoozeHours(config.snooze_hours[0]),
            TokenAction::SnoozeToday,
        ],
        public_base_url: config.public_base_url,
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub dispatch_rx: mpsc::Receiver<DispatchJob>,
}

/// Router state backed by a [`MemoryStore`] and a manual clock.
pub fn test_state(now: DateTime<Utc>) -> TestApp {
    let config = test_config();
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(now));
    let stats = Arc::new(IngestStats::new());
    let (queue, dispatch_rx) = DispatchQueue::channel(config.dispatch_queue, stats.clone());
    let evaluator = Evaluator::new(store.clone(), queue, stats.clone());
    let handler = PacketHandler::new(
        store.clone(),
        Arc::new(FixedGeocoder::new(None)),
        evaluator,
        clock.clone(),
        stats.clone(),
    );
    let state = AppState {
        redeem: Arc::new(RedeemService::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            config.snooze_hours.clone(),
            config.timezone,
        )),
        handler: Arc::new(handler),
        gauge: Arc::new(GaugeService::new(store.clone(), clock.clone(), config.gauge_window())),
        stats,
    };
    TestApp {
        state,
        store,
        clock,
        dispatch_rx,
    }
}

pub fn device(id: &str) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Mast {id}"),
        latitude: None,
        longitude: None,
        place_name: None,
        last_seen: None,
    }
}

pub fn contact(id: i64, device_id: &str, email: &str) -> Contact {
    Contact {
        id,
        device_id: device_id.to_string(),
        email: email.to_string(),
        phone: None,
    }
}

pub fn reading(
    id: i64,
    device_id: &str,
    timestamp: DateTime<Utc>,
    wind_speed: f64,
    amber_alert: bool,
    red_alert: bool,
    downtime_seconds: f64,
) -> WindReading {
    WindReading {
        id,
        device_id: device_id.to_string(),
        timestamp,
        wind_speed,
        latitude: None,
        longitude: None,
        amber_alert,
        red_alert,
        alert_state: amber_alert,
        downtime_seconds,
        processed: false,
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap();
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<EmailMessage>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected { status: 503 });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

pub struct FixedGeocoder {
    name: Option<String>,
}

impl FixedGeocoder {
    pub fn new(name: Option<&str>) -> Self {
        Self {
            name: name.map(str::to_string),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for FixedGeocoder {
    async fn place_name(&self, _fix: GpsFix) -> Result<Option<String>> {
        Ok(self.name.clone())
    }
}

/// Always errors, counting the lookups it was asked for.
#[derive(Default)]
pub struct FailingGeocoder {
    calls: AtomicUsize,
}

impl FailingGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseGeocoder for FailingGeocoder {
    async fn place_name(&self, _fix: GpsFix) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("geocoder unavailable")
    }
}

#[derive(Default)]
struct Inner {
    devices: HashMap<String, Device>,
    thresholds: HashMap<String, Thresholds>,
    readings: Vec<WindReading>,
    next_reading_id: i64,
    buckets: Vec<HistoricalBucket>,
    contacts: Vec<Contact>,
    history: Vec<NotificationRecord>,
    next_history_id: i64,
    archive: Vec<NotificationRecord>,
    tokens: Vec<NotificationToken>,
    snoozes: Vec<Snooze>,
}

/// In-memory repositories with the same conditional-update semantics as `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn add_device(&self, device: Device) {
        self.lock().devices.insert(device.id.clone(), device);
    }

    pub fn set_thresholds(&self, device_id: &str, thresholds: Thresholds) {
        self.lock()
            .thresholds
            .insert(device_id.to_string(), thresholds);
    }

    pub fn add_contact(&self, contact: Contact) {
        self.lock().contacts.push(contact);
    }

    pub fn put_reading(&self, reading: WindReading) {
        let mut inner = self.lock();
        inner.next_reading_id = inner.next_reading_id.max(reading.id);
        inner.readings.push(reading);
        inner.readings.sort_by_key(|r| r.id);
    }

    pub fn put_token(&self, token: NotificationToken) {
        self.lock().tokens.push(token);
    }

    pub fn put_snooze(&self, snooze: Snooze) {
        self.lock().snoozes.push(snooze);
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.lock().devices.get(id).cloned()
    }

    pub fn readings(&self) -> Vec<WindReading> {
        self.lock().readings.clone()
    }

    pub fn reading(&self, id: i64) -> Option<WindReading> {
        self.lock().readings.iter().find(|r| r.id == id).cloned()
    }

    pub fn buckets(&self) -> Vec<HistoricalBucket> {
        self.lock().buckets.clone()
    }

    pub fn history(&self) -> Vec<NotificationRecord> {
        self.lock().history.clone()
    }

    pub fn archive(&self) -> Vec<NotificationRecord> {
        self.lock().archive.clone()
    }

    pub fn tokens(&self) -> Vec<NotificationToken> {
        self.lock().tokens.clone()
    }

    pub fn snoozes(&self) -> Vec<Snooze> {
        self.lock().snoozes.clone()
    }
}

#[async_trait]
impl DeviceRepository for MemoryStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.device(device_id))
    }

    async fn find_thresholds(&self, device_id: &str) -> Result<Option<Thresholds>> {
        Ok(self.lock().thresholds.get(device_id).copied())
    }

    async fn record_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<()> {
        let mut inner = self.lock();
        if let Some(device) = inner.devices.get_mut(device_id) {
            if device.last_seen.map_or(true, |seen| update.seen_at > seen) {
                device.last_seen = Some(update.seen_at);
            }
            if device.latitude.is_none() {
                if let Some(fix) = update.location {
                    device.latitude = Some(fix.latitude);
                    device.longitude = Some(fix.longitude);
                }
            }
            if device.place_name.is_none() {
                device.place_name = update.place_name.clone();
            }
        }
        Ok(())
    }

    async fn list_contacts(&self, device_id: &str) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self
            .lock()
            .contacts
            .iter()
            .filter(|c| c.device_id == device_id)
            .cloned()
            .collect();
        contacts.sort_by_key(|c| c.id);
        Ok(contacts)
    }
}

#[async_trait]
impl ReadingRepository for MemoryStore {
    async fn latest_reading(&self, device_id: &str) -> Result<Option<WindReading>> {
        Ok(self
            .lock()
            .readings
            .iter()
            .filter(|r| r.device_id == device_id)
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn insert_reading(&self, reading: &NewWindReading) -> Result<WindReading> {
        let mut inner = self.lock();
        inner.next_reading_id += 1;
        let stored = WindReading {
            id: inner.next_reading_id,
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            wind_speed: reading.wind_speed,
            latitude: reading.location.map(|fix| fix.latitude),
            longitude: reading.location.map(|fix| fix.longitude),
            amber_alert: reading.amber_alert,
            red_alert: reading.red_alert,
            alert_state: reading.alert_state,
            downtime_seconds: reading.downtime_seconds,
            processed: false,
        };
        inner.readings.push(stored.clone());
        Ok(stored)
    }

    async fn readings_since(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WindReading>> {
        let mut readings: Vec<WindReading> = self
            .lock()
            .readings
            .iter()
            .filter(|r| r.device_id == device_id && r.timestamp > since)
            .cloned()
            .collect();
        readings.sort_by_key(|r| r.timestamp);
        Ok(readings)
    }

    async fn last_bucket_end(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().buckets.iter().map(|b| b.interval_end).max())
    }

    async fn devices_with_unprocessed(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut devices: Vec<String> = self
            .lock()
            .readings
            .iter()
            .filter(|r| !r.processed && r.timestamp >= start && r.timestamp < end)
            .map(|r| r.device_id.clone())
            .collect();
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    async fn unprocessed_readings(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WindReading>> {
        let mut readings: Vec<WindReading> = self
            .lock()
            .readings
            .iter()
            .filter(|r| {
                r.device_id == device_id
                    && !r.processed
                    && r.timestamp >= start
                    && r.timestamp < end
            })
            .cloned()
            .collect();
        readings.sort_by_key(|r| (r.timestamp, r.id));
        Ok(readings)
    }

    async fn write_bucket(
        &self,
        bucket: &HistoricalBucket,
        reading_ids: &[i64],
    ) -> Result<BucketWrite> {
        let mut inner = self.lock();
        let conflict = inner.buckets.iter().any(|b| {
            b.device_id == bucket.device_id && b.interval_start == bucket.interval_start
        });
        let claimable = inner
            .readings
            .iter()
            .filter(|r| reading_ids.contains(&r.id) && !r.processed)
            .count();
        if conflict || claimable != reading_ids.len() {
            return Ok(BucketWrite::Skipped);
        }
        for reading in inner.readings.iter_mut() {
            if reading_ids.contains(&reading.id) {
                reading.processed = true;
            }
        }
        inner.buckets.push(bucket.clone());
        Ok(BucketWrite::Written)
    }

    async fn count_unprocessed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .lock()
            .readings
            .iter()
            .filter(|r| !r.processed && r.timestamp <= cutoff)
            .count() as u64)
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.readings.len();
        inner
            .readings
            .retain(|r| !(r.processed && r.timestamp <= cutoff));
        Ok((before - inner.readings.len()) as u64)
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn active_snooze(
        &self,
        device_id: &str,
        contact_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Snooze>> {
        Ok(self
            .lock()
            .snoozes
            .iter()
            .find(|s| s.device_id == device_id && s.contact_id == contact_id && s.is_active(now))
            .cloned())
    }

    async fn latest_notification(
        &self,
        device_id: &str,
        contact_id: i64,
    ) -> Result<Option<NotificationRecord>> {
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|n| n.device_id == device_id && n.contact_id == contact_id)
            .max_by_key(|n| (n.sent_at, n.id))
            .cloned())
    }

    async fn insert_tokens(&self, tokens: &[NotificationToken]) -> Result<()> {
        self.lock().tokens.extend(tokens.iter().cloned());
        Ok(())
    }

    async fn record_notification(&self, notification: &NewNotification) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_history_id += 1;
        let id = inner.next_history_id;
        inner.history.push(NotificationRecord {
            id,
            device_id: notification.device_id.clone(),
            contact_id: notification.contact_id,
            alert_level: notification.alert_level,
            wind_speed: notification.wind_speed,
            sent_at: notification.sent_at,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_action: None,
        });
        Ok(id)
    }

    async fn find_token(&self, token_id: Uuid) -> Result<Option<NotificationToken>> {
        Ok(self
            .lock()
            .tokens
            .iter()
            .find(|t| t.id == token_id)
            .cloned())
    }

    async fn redeem_token(&self, redemption: &Redemption) -> Result<bool> {
        let mut inner = self.lock();
        let Some(token) = inner.tokens.iter_mut().find(|t| {
            t.id == redemption.token_id && !t.used && t.expires_at >= redemption.redeemed_at
        }) else {
            return Ok(false);
        };
        token.used = true;

        let latest = inner
            .history
            .iter_mut()
            .filter(|n| n.device_id == redemption.device_id && n.contact_id == redemption.contact_id)
            .max_by_key(|n| (n.sent_at, n.id));
        if let Some(record) = latest {
            if !record.acknowledged {
                record.acknowledged = true;
                record.acknowledged_at = Some(redemption.redeemed_at);
                record.acknowledged_action = Some(redemption.action.to_string());
            }
        }

        if let Some(snoozed_until) = redemption.snoozed_until {
            let existing = inner.snoozes.iter().position(|s| {
                s.device_id == redemption.device_id && s.contact_id == redemption.contact_id
            });
            match existing {
                Some(idx) => {
                    let snooze = &mut inner.snoozes[idx];
                    snooze.snoozed_until = snoozed_until;
                    snooze.created_at = redemption.redeemed_at;
                }
                None => inner.snoozes.push(Snooze {
                    device_id: redemption.device_id.clone(),
                    contact_id: redemption.contact_id,
                    snoozed_until,
                    created_at: redemption.redeemed_at,
                }),
            }
        }
        Ok(true)
    }

    async fn unsubscribe_contact(
        &self,
        contact_id: i64,
        device_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<UnsubscribeOutcome> {
        let mut inner = self.lock();
        let pair = |d: &str, c: i64| d == device_id && c == contact_id;

        let mut outcome = UnsubscribeOutcome::default();
        let to_archive: Vec<NotificationRecord> = inner
            .history
            .iter()
            .filter(|n| pair(&n.device_id, n.contact_id))
            .cloned()
            .collect();
        for record in to_archive {
            if !inner.archive.iter().any(|a| a.id == record.id) {
                inner.archive.push(record);
                outcome.history_archived += 1;
            }
        }
        inner.history.retain(|n| !pair(&n.device_id, n.contact_id));

        let tokens_before = inner.tokens.len();
        inner.tokens.retain(|t| !pair(&t.device_id, t.contact_id));
        outcome.tokens_removed = (tokens_before - inner.tokens.len()) as u64;

        let snoozes_before = inner.snoozes.len();
        inner.snoozes.retain(|s| !pair(&s.device_id, s.contact_id));
        outcome.snoozes_removed = (snoozes_before - inner.snoozes.len()) as u64;

        let contacts_before = inner.contacts.len();
        inner.contacts.retain(|c| !pair(&c.device_id, c.id));
        outcome.contact_removed = contacts_before != inner.contacts.len();
        Ok(outcome)
    }

    async fn purge_inert_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.tokens.len();
        inner.tokens.retain(|t| !t.used && t.expires_at >= now);
        Ok((before - inner.tokens.len()) as u64)
    }

    async fn purge_expired_snoozes(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.snoozes.len();
        inner.snoozes.retain(|s| s.snoozed_until >= now);
        Ok((before - inner.snoozes.len()) as u64)
    }
}
