use super::{BucketWrite, DeviceRepository, NotificationRepository, ReadingRepository};
use crate::types::{
    AlertLevel, Contact, Device, HeartbeatUpdate, HistoricalBucket, NewNotification,
    NewWindReading, NotificationRecord, NotificationToken, Redemption, Snooze, Thresholds,
    TokenAction, UnsubscribeOutcome, WindReading,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

const READING_COLUMNS: &str = r#"
    id, device_id, ts, wind_speed, latitude, longitude,
    amber_alert, red_alert, alert_state, downtime_seconds, processed
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct ThresholdRow {
    amber_threshold: f64,
    red_threshold: f64,
}

#[derive(FromRow)]
struct NotificationRow {
    id: i64,
    device_id: String,
    contact_id: i64,
    alert_level: String,
    wind_speed: f64,
    sent_at: DateTime<Utc>,
    acknowledged: bool,
    acknowledged_at: Option<DateTime<Utc>>,
    acknowledged_action: Option<String>,
}

impl TryFrom<NotificationRow> for NotificationRecord {
    type Error = anyhow::Error;

    fn try_from(row: NotificationRow) -> Result<Self> {
        let alert_level = AlertLevel::parse(&row.alert_level)
            .ok_or_else(|| anyhow!("unknown alert level {:?} on notification {}", row.alert_level, row.id))?;
        Ok(Self {
            id: row.id,
            device_id: row.device_id,
            contact_id: row.contact_id,
            alert_level,
            wind_speed: row.wind_speed,
            sent_at: row.sent_at,
            acknowledged: row.acknowledged,
            acknowledged_at: row.acknowledged_at,
            acknowledged_action: row.acknowledged_action,
        })
    }
}

#[derive(FromRow)]
struct TokenRow {
    id: Uuid,
    device_id: String,
    contact_id: i64,
    action: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    used: bool,
}

impl TryFrom<TokenRow> for NotificationToken {
    type Error = anyhow::Error;

    fn try_from(row: TokenRow) -> Result<Self> {
        let action = TokenAction::parse(&row.action)
            .ok_or_else(|| anyhow!("unknown token action {:?} on token {}", row.action, row.id))?;
        Ok(Self {
            id: row.id,
            device_id: row.device_id,
            contact_id: row.contact_id,
            action,
            created_at: row.created_at,
            expires_at: row.expires_at,
            used: row.used,
        })
    }
}

#[async_trait]
impl DeviceRepository for PgStore {
    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT id, name, latitude, longitude, place_name, last_seen
            FROM devices
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("load device")?;
        Ok(device)
    }

    async fn find_thresholds(&self, device_id: &str) -> Result<Option<Thresholds>> {
        let row: Option<ThresholdRow> = sqlx::query_as(
            r#"
            SELECT amber_threshold, red_threshold
            FROM wind_alert_thresholds
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("load wind alert thresholds")?;
        Ok(row.map(|row| Thresholds {
            amber: row.amber_threshold,
            red: row.red_threshold,
        }))
    }

    async fn record_heartbeat(&self, device_id: &str, update: &HeartbeatUpdate) -> Result<()> {
        let (latitude, longitude) = match update.location {
            Some(fix) => (Some(fix.latitude), Some(fix.longitude)),
            None => (None, None),
        };
        sqlx::query(
            r#"
            UPDATE devices
            SET last_seen = CASE
                    WHEN last_seen IS NULL OR $2 > last_seen THEN $2
                    ELSE last_seen
                END,
                latitude = CASE WHEN latitude IS NULL THEN $3 ELSE latitude END,
                longitude = CASE WHEN latitude IS NULL THEN $4 ELSE longitude END,
                place_name = COALESCE(place_name, $5)
            WHERE id = $1
            "#,
        )
        .bind(device_id)
        .bind(update.seen_at)
        .bind(latitude)
        .bind(longitude)
        .bind(update.place_name.as_deref())
        .execute(&self.pool)
        .await
        .context("record device heartbeat")?;
        Ok(())
    }

    async fn list_contacts(&self, device_id: &str) -> Result<Vec<Contact>> {
        let contacts = sqlx::query_as::<_, Contact>(
            r#"
            SELECT id, device_id, email, phone
            FROM notification_contacts
            WHERE device_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("list notification contacts")?;
        Ok(contacts)
    }
}

#[async_trait]
impl ReadingRepository for PgStore {
    async fn latest_reading(&self, device_id: &str) -> Result<Option<WindReading>> {
        let reading = sqlx::query_as::<_, WindReading>(&format!(
            "SELECT {READING_COLUMNS} FROM wind_readings WHERE device_id = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("load latest wind reading")?;
        Ok(reading)
    }

    async fn insert_reading(&self, reading: &NewWindReading) -> Result<WindReading> {
        let stored = sqlx::query_as::<_, WindReading>(&format!(
            r#"
            INSERT INTO wind_readings (
                device_id, ts, wind_speed, latitude, longitude,
                amber_alert, red_alert, alert_state, downtime_seconds, processed
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
            RETURNING {READING_COLUMNS}
            "#
        ))
        .bind(&reading.device_id)
        .bind(reading.timestamp)
        .bind(reading.wind_speed)
        .bind(reading.location.map(|fix| fix.latitude))
        .bind(reading.location.map(|fix| fix.longitude))
        .bind(reading.amber_alert)
        .bind(reading.red_alert)
        .bind(reading.alert_state)
        .bind(reading.downtime_seconds)
        .fetch_one(&self.pool)
        .await
        .context("insert wind reading")?;
        Ok(stored)
    }

    async fn readings_since(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<WindReading>> {
        let readings = sqlx::query_as::<_, WindReading>(&format!(
            "SELECT {READING_COLUMNS} FROM wind_readings WHERE device_id = $1 AND ts > $2 ORDER BY ts ASC"
        ))
        .bind(device_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("load recent wind readings")?;
        Ok(readings)
    }

    async fn last_bucket_end(&self) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(interval_end) FROM wind_data_historical")
                .fetch_one(&self.pool)
                .await
                .context("load aggregation high-water mark")?;
        Ok(row.0)
    }

    async fn devices_with_unprocessed(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT device_id
            FROM wind_readings
            WHERE processed = FALSE
              AND ts >= $1
              AND ts < $2
            ORDER BY device_id
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("list devices with unprocessed readings")?;
        Ok(rows.into_iter().map(|(device_id,)| device_id).collect())
    }

    async fn unprocessed_readings(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<WindReading>> {
        let readings = sqlx::query_as::<_, WindReading>(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM wind_readings
            WHERE device_id = $1
              AND processed = FALSE
              AND ts >= $2
              AND ts < $3
            ORDER BY ts ASC, id ASC
            "#
        ))
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("load unprocessed wind readings")?;
        Ok(readings)
    }

    async fn write_bucket(
        &self,
        bucket: &HistoricalBucket,
        reading_ids: &[i64],
    ) -> Result<BucketWrite> {
        let mut tx = self.pool.begin().await?;

        let flagged = sqlx::query(
            r#"
            UPDATE wind_readings
            SET processed = TRUE
            WHERE id = ANY($1)
              AND processed = FALSE
            "#,
        )
        .bind(reading_ids)
        .execute(&mut *tx)
        .await
        .context("flag readings processed")?
        .rows_affected();
        if flagged != reading_ids.len() as u64 {
            tx.rollback().await?;
            return Ok(BucketWrite::Skipped);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO wind_data_historical (
                device_id, interval_start, interval_end,
                avg_wind_speed, max_wind_speed, std_deviation,
                alert_triggered, amber_alert_triggered, red_alert_triggered,
                downtime_seconds, sample_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (device_id, interval_start) DO NOTHING
            "#,
        )
        .bind(&bucket.device_id)
        .bind(bucket.interval_start)
        .bind(bucket.interval_end)
        .bind(bucket.avg_wind_speed)
        .bind(bucket.max_wind_speed)
        .bind(bucket.std_deviation)
        .bind(bucket.alert_triggered)
        .bind(bucket.amber_alert_triggered)
        .bind(bucket.red_alert_triggered)
        .bind(bucket.downtime_seconds)
        .bind(bucket.sample_count)
        .execute(&mut *tx)
        .await
        .context("insert historical bucket")?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(BucketWrite::Skipped);
        }

        tx.commit().await?;
        Ok(BucketWrite::Written)
    }

    async fn count_unprocessed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM wind_readings WHERE processed = FALSE AND ts <= $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .context("count stale unprocessed readings")?;
        Ok(row.0.max(0) as u64)
    }

    async fn purge_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM wind_readings WHERE processed = TRUE AND ts <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("purge processed readings")?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn active_snooze(
        &self,
        device_id: &str,
        contact_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Snooze>> {
        let snooze = sqlx::query_as::<_, Snooze>(
            r#"
            SELECT device_id, contact_id, snoozed_until, created_at
            FROM notification_snooze_status
            WHERE device_id = $1
              AND contact_id = $2
              AND snoozed_until > $3
            "#,
        )
        .bind(device_id)
        .bind(contact_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("load snooze status")?;
        Ok(snooze)
    }

    async fn latest_notification(
        &self,
        device_id: &str,
        contact_id: i64,
    ) -> Result<Option<NotificationRecord>> {
        let row: Option<NotificationRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, contact_id, alert_level, wind_speed, sent_at,
                   acknowledged, acknowledged_at, acknowledged_action
            FROM notification_history
            WHERE device_id = $1
              AND contact_id = $2
            ORDER BY sent_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await
        .context("load latest notification")?;
        row.map(NotificationRecord::try_from).transpose()
    }

    async fn insert_tokens(&self, tokens: &[NotificationToken]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for token in tokens {
            sqlx::query(
                r#"
                INSERT INTO notification_tokens (id, device_id, contact_id, action, created_at, expires_at, used)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(token.id)
            .bind(&token.device_id)
            .bind(token.contact_id)
            .bind(token.action.to_string())
            .bind(token.created_at)
            .bind(token.expires_at)
            .bind(token.used)
            .execute(&mut *tx)
            .await
            .context("insert notification token")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_notification(&self, notification: &NewNotification) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO notification_history (device_id, contact_id, alert_level, wind_speed, sent_at, acknowledged)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            RETURNING id
            "#,
        )
        .bind(&notification.device_id)
        .bind(notification.contact_id)
        .bind(notification.alert_level.as_str())
        .bind(notification.wind_speed)
        .bind(notification.sent_at)
        .fetch_one(&self.pool)
        .await
        .context("record notification history")?;
        Ok(row.0)
    }

    async fn find_token(&self, token_id: Uuid) -> Result<Option<NotificationToken>> {
        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, contact_id, action, created_at, expires_at, used
            FROM notification_tokens
            WHERE id = $1
            "#,
        )
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await
        .context("load notification token")?;
        row.map(NotificationToken::try_from).transpose()
    }

    async fn redeem_token(&self, redemption: &Redemption) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE notification_tokens
            SET used = TRUE
            WHERE id = $1
              AND used = FALSE
              AND expires_at >= $2
            "#,
        )
        .bind(redemption.token_id)
        .bind(redemption.redeemed_at)
        .execute(&mut *tx)
        .await
        .context("claim notification token")?
        .rows_affected();
        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE notification_history
            SET acknowledged = TRUE,
                acknowledged_at = $3,
                acknowledged_action = $4
            WHERE id = (
                SELECT id
                FROM notification_history
                WHERE device_id = $1
                  AND contact_id = $2
                ORDER BY sent_at DESC, id DESC
                LIMIT 1
            )
              AND acknowledged = FALSE
            "#,
        )
        .bind(&redemption.device_id)
        .bind(redemption.contact_id)
        .bind(redemption.redeemed_at)
        .bind(redemption.action.to_string())
        .execute(&mut *tx)
        .await
        .context("acknowledge notification")?;

        if let Some(snoozed_until) = redemption.snoozed_until {
            sqlx::query(
                r#"
                INSERT INTO notification_snooze_status (device_id, contact_id, snoozed_until, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (device_id, contact_id)
                DO UPDATE SET snoozed_until = EXCLUDED.snoozed_until,
                              created_at = EXCLUDED.created_at
                "#,
            )
            .bind(&redemption.device_id)
            .bind(redemption.contact_id)
            .bind(snoozed_until)
            .bind(redemption.redeemed_at)
            .execute(&mut *tx)
            .await
            .context("upsert snooze status")?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn unsubscribe_contact(
        &self,
        contact_id: i64,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UnsubscribeOutcome> {
        let mut tx = self.pool.begin().await?;

        let history_archived = sqlx::query(
            r#"
            INSERT INTO notification_history_archive (
                original_id, device_id, contact_id, alert_level, wind_speed, sent_at,
                acknowledged, acknowledged_at, acknowledged_action, archived_at
            )
            SELECT id, device_id, contact_id, alert_level, wind_speed, sent_at,
                   acknowledged, acknowledged_at, acknowledged_action, $3
            FROM notification_history
            WHERE contact_id = $1
              AND device_id = $2
            ON CONFLICT (original_id) DO NOTHING
            "#,
        )
        .bind(contact_id)
        .bind(device_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("archive notification history")?
        .rows_affected();

        sqlx::query("DELETE FROM notification_history WHERE contact_id = $1 AND device_id = $2")
            .bind(contact_id)
            .bind(device_id)
            .execute(&mut *tx)
            .await
            .context("delete notification history")?;

        let tokens_removed =
            sqlx::query("DELETE FROM notification_tokens WHERE contact_id = $1 AND device_id = $2")
                .bind(contact_id)
                .bind(device_id)
                .execute(&mut *tx)
                .await
                .context("delete notification tokens")?
                .rows_affected();

        let snoozes_removed = sqlx::query(
            "DELETE FROM notification_snooze_status WHERE contact_id = $1 AND device_id = $2",
        )
        .bind(contact_id)
        .bind(device_id)
        .execute(&mut *tx)
        .await
        .context("delete snooze status")?
        .rows_affected();

        let contact_removed =
            sqlx::query("DELETE FROM notification_contacts WHERE id = $1 AND device_id = $2")
                .bind(contact_id)
                .bind(device_id)
                .execute(&mut *tx)
                .await
                .context("delete notification contact")?
                .rows_affected()
                > 0;

        tx.commit().await?;
        Ok(UnsubscribeOutcome {
            contact_removed,
            history_archived,
            tokens_removed,
            snoozes_removed,
        })
    }

    async fn purge_inert_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM notification_tokens WHERE used = TRUE OR expires_at < $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .context("purge inert tokens")?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_snoozes(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM notification_snooze_status WHERE snoozed_until < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("purge expired snoozes")?;
        Ok(result.rows_affected())
    }
}
