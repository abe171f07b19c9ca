//! Repository seams between the pipeline and the relational store.
//!
//! Every flag transition (`processed`, `used`, `acknowledged`) is a single conditional update
//! on the store side so concurrent workers cannot double-apply it.

mod postgres;


pub use postgres::PgStore;

use crate::types::{
    Contact, Device, HeartbeatUpdate, HistoricalBucket, NewNotification, NewWindReading,
    NotificationRecord, NotificationToken, Redemption, Snooze, Thresholds, UnsubscribeOutcome,
    WindReading,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketWrite {
    Written,
    /// Another worker already flagged the readings or produced the bucket.
    Skipped,
}

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn find_thresholds(&self, device_id: &str) -> Result<Option<Thresholds>>;

    async fn record_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<()>;

    async fn list_contacts(&self, device_id: &str) -> Result<Vec<Contact>>;
}

#[async_trait]
pub trait ReadingRepository: Send + Sync {
    /// Most recently stored reading for the device (insertion order).
    async fn latest_reading(&self, device_id: &str) -> Result<Option<WindReading>>;

    async fn insert_reading(&self, reading: &NewWindReading) -> Result<WindReading>;

    async fn readings_since(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WindReading>>;

    /// End of the newest bucket ever written; the aggregation high-water mark.
    async fn last_bucket_end(&self) -> Result<Option<DateTime<Utc>>>;

    async fn devices_with_unprocessed(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Unprocessed readings in `[start, end)`, ordered by timestamp.
    async fn unprocessed_readings(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WindReading>>;

    /// Writes the bucket and flags `reading_ids` processed in one transaction.
    async fn write_bucket(
        &self,
        bucket: &HistoricalBucket,
        reading_ids: &[i64],
    ) -> Result<BucketWrite>;

    async fn count_unprocessed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Deletes processed readings with `timestamp <= cutoff`. Never touches unprocessed rows.
    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn active_snooze(
        &self,
        device_id: &str,
        contact_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Snooze>>;

    async fn latest_notification(
        &self,
        device_id: &str,
        contact_id: i64,
    ) -> Result<Option<NotificationRecord>>;

    async fn insert_tokens(&self, tokens: &[NotificationToken]) -> Result<()>;

    async fn record_notification(&self, notification: &NewNotification) -> Result<i64>;

    async fn find_token(&self, token_id: Uuid) -> Result<Option<NotificationToken>>;

    /// Marks the token used, acknowledges the latest notification for the pair and upserts the
    /// snooze. Returns `false` without side effects when the token was already used or expired.
    async fn redeem_token(&self, redemption: &Redemption) -> Result<bool>;

    /// Archives history, then removes history, tokens, snoozes and the contact. Safe to repeat.
    async fn unsubscribe_contact(
        &self,
        contact_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UnsubscribeOutcome>;

    async fn purge_inert_tokens(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn purge_expired_snoozes(&self, now: DateTime<Utc>) -> Result<u64>;
}
