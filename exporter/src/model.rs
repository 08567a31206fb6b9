use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OAuth2 token pair held by the exporter.
///
/// The refresh token is single-use: every successful exchange returns a new
/// one and invalidates the previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential that only carries a refresh token, as supplied at startup.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            expires_at: None,
        }
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// True when the tracked expiry is known and `now + margin` is past it.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|at| now + margin >= at)
    }
}

/// Identity endpoint response for both the refresh and code grants.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn into_credential(self, issued_at: DateTime<Utc>) -> Credential {
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| issued_at + chrono::Duration::seconds(secs)),
        }
    }
}

/// One device as extracted from the telemetry payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReading {
    pub station_name: String,
    pub mac_address: String,
    pub city: String,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub co2_ppm: Option<f64>,
    pub noise_db: Option<f64>,
    pub pressure_mb: Option<f64>,
    pub absolute_pressure_mb: Option<f64>,
    pub health_index: Option<f64>,
    pub wifi_signal: Option<f64>,
}

/// Labels identifying one sensor series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesLabels {
    pub station_name: String,
    pub address_mac: String,
    pub city: String,
}

impl SeriesLabels {
    pub fn as_values(&self) -> [&str; 3] {
        [&self.station_name, &self.address_mac, &self.city]
    }
}

/// The eight gauges published per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKind {
    Temperature,
    Humidity,
    Co2,
    Noise,
    Pressure,
    AbsolutePressure,
    HealthIndex,
    WifiSignal,
}

impl MetricKind {
    pub const ALL: [MetricKind; 8] = [
        MetricKind::Temperature,
        MetricKind::Humidity,
        MetricKind::Co2,
        MetricKind::Noise,
        MetricKind::Pressure,
        MetricKind::AbsolutePressure,
        MetricKind::HealthIndex,
        MetricKind::WifiSignal,
    ];

    pub fn metric_name(self) -> &'static str {
        match self {
            MetricKind::Temperature => "netatmo_sensor_temperature_celsius",
            MetricKind::Humidity => "netatmo_sensor_humidity_percent",
            MetricKind::Co2 => "netatmo_sensor_co2_ppm",
            MetricKind::Noise => "netatmo_sensor_noise_db",
            MetricKind::Pressure => "netatmo_sensor_pressure_mb",
            MetricKind::AbsolutePressure => "netatmo_sensor_absolute_pressure_mb",
            MetricKind::HealthIndex => "netatmo_sensor_health_idx",
            MetricKind::WifiSignal => "netatmo_sensor_rf_signal_strength",
        }
    }

    pub fn help(self) -> &'static str {
        match self {
            MetricKind::Temperature => "Temperature in Celsius",
            MetricKind::Humidity => "Relative humidity percentage",
            MetricKind::Co2 => "CO2 level in ppm",
            MetricKind::Noise => "Noise level in dB",
            MetricKind::Pressure => "Atmospheric pressure in mbar",
            MetricKind::AbsolutePressure => "Absolute pressure in mbar",
            MetricKind::HealthIndex => "Health index",
            MetricKind::WifiSignal => "WiFi signal strength",
        }
    }

    pub fn value_of(self, reading: &DeviceReading) -> Option<f64> {
        match self {
            MetricKind::Temperature => reading.temperature_c,
            MetricKind::Humidity => reading.humidity_pct,
            MetricKind::Co2 => reading.co2_ppm,
            MetricKind::Noise => reading.noise_db,
            MetricKind::Pressure => reading.pressure_mb,
            MetricKind::AbsolutePressure => reading.absolute_pressure_mb,
            MetricKind::HealthIndex => reading.health_index,
            MetricKind::WifiSignal => reading.wifi_signal,
        }
    }
}

/// One labelled value ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub metric: MetricKind,
    pub labels: SeriesLabels,
    pub value: f64,
}
