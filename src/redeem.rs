use crate::error::RedeemError;
use crate::schedule::{Clock, Job};
use crate::store::{DeviceRepository, NotificationRepository};
use crate::types::{AlertLevel, NotificationToken, Redemption, TokenAction, UnsubscribeOutcome};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Display context returned when a token link is opened.
#[derive(Debug, Clone, Serialize)]
pub struct TokenContext {
    pub token_id: Uuid,
    pub device_id: String,
    pub device_name: Option<String>,
    pub place_name: Option<String>,
    pub contact_id: i64,
    pub action: String,
    pub expires_at: DateTime<Utc>,
    pub alert_level: Option<AlertLevel>,
    pub wind_speed: Option<f64>,
    pub sent_at: Option<DateTime<Utc>>,
    pub permitted_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedeemOutcome {
    pub device_id: String,
    pub contact_id: i64,
    pub action: String,
    pub snoozed_until: Option<DateTime<Utc>>,
}

/// Last millisecond of the local calendar day containing `now`, as UTC.
pub fn end_of_local_day(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_date = now.with_timezone(&tz).date_naive();
    let end = local_date
        .and_hms_milli_opt(23, 59, 59, 999)
        .and_then(|naive| tz.from_local_datetime(&naive).latest());
    match end {
        Some(end) => end.with_timezone(&Utc),
        None => start_of_next_day(local_date, tz)
            .map(|start| start - Duration::milliseconds(1))
            .unwrap_or(now + Duration::hours(24)),
    }
}

fn start_of_next_day(date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    let next = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
    tz.from_local_datetime(&next)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct RedeemService {
    devices: Arc<dyn DeviceRepository>,
    notifications: Arc<dyn NotificationRepository>,
    clock: Arc<dyn Clock>,
    snooze_hours: Vec<u32>,
    timezone: Tz,
}

impl RedeemService {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        notifications: Arc<dyn NotificationRepository>,
        clock: Arc<dyn Clock>,
        snooze_hours: Vec<u32>,
        timezone: Tz,
    ) -> Self {
        Self {
            devices,
            notifications,
            clock,
            snooze_hours,
            timezone,
        }
    }

    pub fn permitted_actions(&self) -> Vec<TokenAction> {
        let mut actions = vec![TokenAction::Acknowledge];
        actions.extend(self.snooze_hours.iter().map(|h| TokenAction::SnoozeHours(*h)));
        actions.push(TokenAction::SnoozeToday);
        actions
    }

    fn is_permitted(&self, action: TokenAction) -> bool {
        match action {
            TokenAction::Acknowledge | TokenAction::SnoozeToday => true,
            TokenAction::SnoozeHours(hours) => self.snooze_hours.contains(&hours),
        }
    }

    async fn live_token(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<NotificationToken, RedeemError> {
        let token = self
            .notifications
            .find_token(token_id)
            .await?
            .ok_or(RedeemError::NotFound)?;
        if token.used {
            return Err(RedeemError::AlreadyUsed);
        }
        if token.is_expired(now) {
            return Err(RedeemError::Expired);
        }
        Ok(token)
    }

    pub async fn inspect(&self, token_id: Uuid) -> Result<TokenContext, RedeemError> {
        let now = self.clock.now();
        let token = self.live_token(token_id, now).await?;
        let device = self.devices.find_device(&token.device_id).await?;
        let latest = self
            .notifications
            .latest_notification(&token.device_id, token.contact_id)
            .await?;

        Ok(TokenContext {
            token_id: token.id,
            device_id: token.device_id,
            device_name: device.as_ref().map(|d| d.name.clone()),
            place_name: device.and_then(|d| d.place_name),
            contact_id: token.contact_id,
            action: token.action.to_string(),
            expires_at: token.expires_at,
            alert_level: latest.as_ref().map(|n| n.alert_level),
            wind_speed: latest.as_ref().map(|n| n.wind_speed),
            sent_at: latest.as_ref().map(|n| n.sent_at),
            permitted_actions: self
                .permitted_actions()
                .into_iter()
                .map(|a| a.to_string())
                .collect(),
        })
    }

    /// Redeems the token with `requested`, or with the token's own action when none is given.
    pub async fn redeem(
        &self,
        token_id: Uuid,
        requested: Option<&str>,
    ) -> Result<RedeemOutcome, RedeemError> {
        let now = self.clock.now();
        let token = self.live_token(token_id, now).await?;

        let action = match requested.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                TokenAction::parse(raw).ok_or_else(|| RedeemError::InvalidAction(raw.to_string()))?
            }
            None => token.action,
        };
        if !self.is_permitted(action) {
            return Err(RedeemError::InvalidAction(action.to_string()));
        }

        let snoozed_until = match action {
            TokenAction::Acknowledge => None,
            TokenAction::SnoozeHours(hours) => Some(now + Duration::hours(i64::from(hours))),
            TokenAction::SnoozeToday => Some(end_of_local_day(now, self.timezone)),
        };

        let redemption = Redemption {
            token_id,
            device_id: token.device_id.clone(),
            contact_id: token.contact_id,
            action,
            redeemed_at: now,
            snoozed_until,
        };
        if !self.notifications.redeem_token(&redemption).await? {
            // Lost a race with another redemption or the expiry boundary.
            return Err(match self.notifications.find_token(token_id).await? {
                None => RedeemError::NotFound,
                Some(current) if current.is_expired(now) && !current.used => RedeemError::Expired,
                Some(_) => RedeemError::AlreadyUsed,
            });
        }

        tracing::info!(
            device_id = %redemption.device_id,
            contact_id = redemption.contact_id,
            action = %action,
            snoozed_until = ?snoozed_until,
            "token redeemed"
        );
        Ok(RedeemOutcome {
            device_id: redemption.device_id,
            contact_id: redemption.contact_id,
            action: action.to_string(),
            snoozed_until,
        })
    }

    pub async fn unsubscribe(&self, contact_id: i64, device_id: &str) -> Result<UnsubscribeOutcome> {
        let outcome = self
            .notifications
            .unsubscribe_contact(contact_id, device_id, self.clock.now())
            .await?;
        tracing::info!(
            device_id,
            contact_id,
            contact_removed = outcome.contact_removed,
            history_archived = outcome.history_archived,
            "contact unsubscribed"
        );
        Ok(outcome)
    }
}

/// Periodic removal of inert tokens and lapsed snoozes.
pub struct CleanupJob {
    notifications: Arc<dyn NotificationRepository>,
}

impl CleanupJob {
    pub fn new(notifications: Arc<dyn NotificationRepository>) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl Job for CleanupJob {
    fn name(&self) -> &'static str {
        "notification-cleanup"
    }

    async fn run(&self, now: DateTime<Utc>) -> Result<()> {
        let tokens = self.notifications.purge_inert_tokens(now).await?;
        let snoozes = self.notifications.purge_expired_snoozes(now).await?;
        tracing::info!(tokens, snoozes, "notification cleanup complete");
        Ok(())
    }
}
