use crate::error::TransportError;
use crate::types::{AlertLevel, NotificationToken, TokenAction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError>;
}

#[derive(Serialize)]
struct Address<'a> {
    email: &'a str,
}

#[derive(Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    value: &'a str,
}

#[derive(Serialize)]
struct MailSendPayload<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

/// SendGrid v3 style mail-send API with a bearer key.
pub struct HttpEmailTransport {
    client: Client,
    url: String,
    api_key: String,
    from: String,
}

impl HttpEmailTransport {
    pub fn new(url: String, api_key: String, from: String) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl EmailTransport for HttpEmailTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        if self.api_key.is_empty() {
            return Err(TransportError::NotConfigured);
        }
        let payload = MailSendPayload {
            personalizations: vec![Personalization {
                to: vec![Address { email: &message.to }],
            }],
            from: Address { email: &self.from },
            subject: &message.subject,
            content: vec![Content {
                kind: "text/html",
                value: &message.html,
            }],
        };
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Used when no API key is configured: messages are logged instead of delivered.
#[derive(Debug, Default)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), TransportError> {
        tracing::info!(to = %message.to, subject = %message.subject, "email transport disabled; logging alert");
        Ok(())
    }
}

pub fn action_link(base_url: &str, token: &NotificationToken) -> String {
    format!(
        "{}/alert/acknowledge/{}?action={}",
        base_url.trim_end_matches('/'),
        token.id,
        token.action
    )
}

fn action_label(action: TokenAction) -> String {
    match action {
        TokenAction::Acknowledge => "Acknowledge".to_string(),
        TokenAction::SnoozeHours(1) => "Snooze for 1 hour".to_string(),
        TokenAction::SnoozeHours(hours) => format!("Snooze for {hours} hours"),
        TokenAction::SnoozeToday => "Snooze until end of day".to_string(),
    }
}

pub struct AlertEmail<'a> {
    pub to: &'a str,
    pub device_name: &'a str,
    pub place_name: Option<&'a str>,
    pub level: AlertLevel,
    pub wind_speed: f64,
    pub observed_at: DateTime<Utc>,
    pub base_url: &'a str,
    pub tokens: &'a [NotificationToken],
}

pub fn render_alert(email: &AlertEmail<'_>) -> EmailMessage {
    let level = match email.level {
        AlertLevel::Red => "RED",
        AlertLevel::Amber => "AMBER",
        AlertLevel::Normal => "NORMAL",
    };
    let subject = format!("{level} wind alert: {}", email.device_name);

    let mut html = String::new();
    html.push_str(&format!(
        "<h2>{level} wind alert for {}</h2>",
        escape_html(email.device_name)
    ));
    if let Some(place) = email.place_name {
        html.push_str(&format!("<p>Location: {}</p>", escape_html(place)));
    }
    html.push_str(&format!(
        "<p>Wind speed {:.1} recorded at {}.</p><ul>",
        email.wind_speed,
        email.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    for token in email.tokens {
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>",
            escape_html(&action_link(email.base_url, token)),
            action_label(token.action)
        ));
    }
    html.push_str("</ul>");

    EmailMessage {
        to: email.to.to_string(),
        subject,
        html,
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
