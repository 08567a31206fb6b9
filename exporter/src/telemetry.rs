use crate::errors::{FetchError, Result};
use crate::oauth::describe;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of the raw device list.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn fetch(&self, access_token: &str) -> std::result::Result<Vec<Value>, FetchError>;
}

/// Authenticated client for the Home Coach data endpoint.
pub struct TelemetryClient {
    http: Client,
    api_url: String,
}

impl TelemetryClient {
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
        })
    }
}

#[async_trait]
impl TelemetrySource for TelemetryClient {
    async fn fetch(&self, access_token: &str) -> std::result::Result<Vec<Value>, FetchError> {
        let response = self
            .http
            .get(&self.api_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| FetchError::Transient(describe(&e)))?;

        let status = response.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(FetchError::AuthRejected(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Telemetry endpoint returned {}: {}", status, body);
            return Err(FetchError::Transient(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(describe(&e)))?;
        let devices = extract_devices(&bytes)?;
        debug!("Fetched {} devices", devices.len());
        Ok(devices)
    }
}

/// Pulls `body.devices` out of a telemetry response.
pub fn extract_devices(payload: &[u8]) -> std::result::Result<Vec<Value>, FetchError> {
    let mut root: Value = serde_json::from_slice(payload)
        .map_err(|e| FetchError::Permanent(format!("invalid JSON: {}", e)))?;

    match root.pointer_mut("/body/devices").map(Value::take) {
        Some(Value::Array(devices)) => Ok(devices),
        Some(_) => Err(FetchError::Permanent(
            "`body.devices` is not an array".to_string(),
        )),
        None => Err(FetchError::Permanent(
            "response has no `body.devices`".to_string(),
        )),
    }
}
