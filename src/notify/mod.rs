//! Alert notification dispatch.
//!
//! Each contact of an alerting device is evaluated independently: an active snooze always wins,
//! then the cooldown applies unless the alert escalates from amber to red. A send mints one token
//! per offered action, delivers the email, and only then records history, so a failed delivery is
//! retried by the next alerting reading rather than counted as notified.

mod email;
mod queue;

pub use email::{
    action_link, render_alert, AlertEmail, EmailMessage, EmailTransport, HttpEmailTransport,
    LogTransport,
};
pub use queue::{spawn_worker, DispatchQueue};

use crate::schedule::Clock;
use crate::stats::IngestStats;
use crate::store::{DeviceRepository, NotificationRepository};
use crate::types::{
    AlertLevel, Contact, NewNotification, NotificationRecord, NotificationToken, Snooze,
    TokenAction,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    pub device_id: String,
    pub device_name: String,
    pub place_name: Option<String>,
    pub level: AlertLevel,
    pub wind_speed: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    Snoozed,
    Cooldown,
    NotAlerting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Send,
    Suppress(SuppressReason),
}

pub fn decide(
    snooze: Option<&Snooze>,
    latest: Option<&NotificationRecord>,
    level: AlertLevel,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> Decision {
    if level == AlertLevel::Normal {
        return Decision::Suppress(SuppressReason::NotAlerting);
    }
    if snooze.is_some_and(|snooze| snooze.is_active(now)) {
        return Decision::Suppress(SuppressReason::Snoozed);
    }
    let Some(previous) = latest else {
        return Decision::Send;
    };
    let cooldown_threshold = now - cooldown;
    if previous.sent_at > cooldown_threshold {
        let escalation = level == AlertLevel::Red && previous.alert_level == AlertLevel::Amber;
        if !escalation {
            return Decision::Suppress(SuppressReason::Cooldown);
        }
    }
    Decision::Send
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    Sent,
    Suppressed(SuppressReason),
    Failed,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub cooldown: Duration,
    pub token_ttl: Duration,
    /// Offered actions, in link order.
    pub offered_actions: Vec<TokenAction>,
    pub public_base_url: String,
}

pub struct DispatchEngine {
    devices: Arc<dyn DeviceRepository>,
    notifications: Arc<dyn NotificationRepository>,
    transport: Arc<dyn EmailTransport>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
    stats: Arc<IngestStats>,
}

impl DispatchEngine {
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        notifications: Arc<dyn NotificationRepository>,
        transport: Arc<dyn EmailTransport>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            devices,
            notifications,
            transport,
            clock,
            settings,
            stats,
        }
    }

    /// Evaluates every contact of the device concurrently. Only the contact listing can fail the
    /// whole job; per-contact failures are logged and counted.
    pub async fn dispatch(&self, job: &DispatchJob) -> Result<Vec<(i64, ContactOutcome)>> {
        let contacts = self.devices.list_contacts(&job.device_id).await?;
        if contacts.is_empty() {
            tracing::debug!(device_id = %job.device_id, "no contacts registered; nothing to send");
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let outcomes = join_all(
            contacts
                .iter()
                .map(|contact| self.notify_contact(job, contact, now)),
        )
        .await;
        Ok(contacts.iter().map(|c| c.id).zip(outcomes).collect())
    }

    async fn notify_contact(
        &self,
        job: &DispatchJob,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> ContactOutcome {
        match self.try_notify_contact(job, contact, now).await {
            Ok(outcome) => {
                match outcome {
                    ContactOutcome::Sent => IngestStats::incr(&self.stats.notifications_sent),
                    ContactOutcome::Suppressed(_) => {
                        IngestStats::incr(&self.stats.notifications_suppressed)
                    }
                    ContactOutcome::Failed => IngestStats::incr(&self.stats.notifications_failed),
                }
                outcome
            }
            Err(err) => {
                IngestStats::incr(&self.stats.notifications_failed);
                tracing::warn!(
                    device_id = %job.device_id,
                    contact_id = contact.id,
                    error = %format!("{err:#}"),
                    "notification store error"
                );
                ContactOutcome::Failed
            }
        }
    }

    async fn try_notify_contact(
        &self,
        job: &DispatchJob,
        contact: &Contact,
        now: DateTime<Utc>,
    ) -> Result<ContactOutcome> {
        let snooze = self
            .notifications
            .active_snooze(&job.device_id, contact.id, now)
            .await?;
        let latest = if snooze.is_some() {
            None
        } else {
            self.notifications
                .latest_notification(&job.device_id, contact.id)
                .await?
        };

        if let Decision::Suppress(reason) = decide(
            snooze.as_ref(),
            latest.as_ref(),
            job.level,
            now,
            self.settings.cooldown,
        ) {
            tracing::debug!(
                device_id = %job.device_id,
                contact_id = contact.id,
                reason = ?reason,
                "notification suppressed"
            );
            return Ok(ContactOutcome::Suppressed(reason));
        }

        let tokens = self.mint_tokens(&job.device_id, contact.id, now);
        self.notifications.insert_tokens(&tokens).await?;

        let message = render_alert(&AlertEmail {
            to: &contact.email,
            device_name: &job.device_name,
            place_name: job.place_name.as_deref(),
            level: job.level,
            wind_speed: job.wind_speed,
            observed_at: job.observed_at,
            base_url: &self.settings.public_base_url,
            tokens: &tokens,
        });

        if let Err(err) = self.transport.send(&message).await {
            tracing::warn!(
                device_id = %job.device_id,
                contact_id = contact.id,
                error = %err,
                "email transport failed; history not recorded"
            );
            return Ok(ContactOutcome::Failed);
        }

        self.notifications
            .record_notification(&NewNotification {
                device_id: job.device_id.clone(),
                contact_id: contact.id,
                alert_level: job.level,
                wind_speed: job.wind_speed,
                sent_at: now,
            })
            .await?;
        tracing::info!(
            device_id = %job.device_id,
            contact_id = contact.id,
            level = %job.level,
            "alert notification sent"
        );
        Ok(ContactOutcome::Sent)
    }

    fn mint_tokens(&self, device_id: &str, contact_id: i64, now: DateTime<Utc>) -> Vec<NotificationToken> {
        self.settings
            .offered_actions
            .iter()
            .map(|action| NotificationToken {
                id: Uuid::new_v4(),
                device_id: device_id.to_string(),
                contact_id,
                action: *action,
                created_at: now,
                expires_at: now + self.settings.token_ttl,
                used: false,
            })
            .collect()
    }
}
