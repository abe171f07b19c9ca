use crate::types::GpsFix;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Best-effort place name for a coordinate. Callers treat errors as non-fatal.
#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn place_name(&self, fix: GpsFix) -> Result<Option<String>>;
}

/// Nominatim-compatible endpoint queried with `lat`, `lon` and `format=json`.
pub struct HttpGeocoder {
    http: Client,
    url: String,
}

#[derive(Deserialize)]
struct GeocodeEnvelope {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl HttpGeocoder {
    pub fn new(url: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("wind-telemetry/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build geocoder HTTP client")?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ReverseGeocoder for HttpGeocoder {
    async fn place_name(&self, fix: GpsFix) -> Result<Option<String>> {
        let payload: GeocodeEnvelope = self
            .http
            .get(&self.url)
            .query(&[
                ("lat", fix.latitude.to_string()),
                ("lon", fix.longitude.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Failed to decode reverse geocoding response")?;
        Ok(payload
            .display_name
            .or(payload.name)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty()))
    }
}

/// Used when no geocoder is configured.
#[derive(Debug, Default)]
pub struct NoopGeocoder;

#[async_trait]
impl ReverseGeocoder for NoopGeocoder {
    async fn place_name(&self, _fix: GpsFix) -> Result<Option<String>> {
        Ok(None)
    }
}
