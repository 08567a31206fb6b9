use crate::errors::MappingFailure;
use crate::model::{DeviceReading, MetricKind, MetricSample, SeriesLabels};
use serde_json::Value;

/// Samples produced from one telemetry response, plus the devices that had to
/// be skipped.
#[derive(Debug, Default)]
pub struct MappingOutcome {
    pub samples: Vec<MetricSample>,
    pub devices: usize,
    pub failures: Vec<MappingFailure>,
}

/// Maps a raw device list to metric samples.
///
/// A device without a station name or MAC address is dropped and reported in
/// `failures`; the remaining devices are mapped regardless.
pub fn map_devices(devices: &[Value]) -> MappingOutcome {
    let mut outcome = MappingOutcome::default();

    for (index, device) in devices.iter().enumerate() {
        match parse_device(index, device) {
            Ok(reading) => {
                outcome.devices += 1;
                outcome.samples.extend(samples_for(&reading));
            }
            Err(failure) => outcome.failures.push(failure),
        }
    }

    outcome
}

/// Extracts a [`DeviceReading`] from one entry of `body.devices`.
pub fn parse_device(index: usize, device: &Value) -> Result<DeviceReading, MappingFailure> {
    if !device.is_object() {
        return Err(MappingFailure::NotAnObject { index });
    }

    let station_name = identity(device, "station_name")
        .ok_or(MappingFailure::MissingIdentity { index, field: "station_name" })?;
    let mac_address =
        identity(device, "_id").ok_or(MappingFailure::MissingIdentity { index, field: "_id" })?;
    let city = device
        .pointer("/place/city")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let dashboard = |field: &str| {
        device
            .get("dashboard_data")
            .and_then(|d| d.get(field))
            .and_then(Value::as_f64)
    };

    Ok(DeviceReading {
        station_name,
        mac_address,
        city,
        temperature_c: dashboard("Temperature"),
        humidity_pct: dashboard("Humidity"),
        co2_ppm: dashboard("CO2"),
        noise_db: dashboard("Noise"),
        pressure_mb: dashboard("Pressure"),
        absolute_pressure_mb: dashboard("AbsolutePressure"),
        health_index: dashboard("health_idx"),
        wifi_signal: device.get("wifi_status").and_then(Value::as_f64),
    })
}

/// One sample per measurement present on the reading.
pub fn samples_for(reading: &DeviceReading) -> impl Iterator<Item = MetricSample> + '_ {
    let labels = SeriesLabels {
        station_name: reading.station_name.clone(),
        address_mac: reading.mac_address.clone(),
        city: reading.city.clone(),
    };

    MetricKind::ALL.into_iter().filter_map(move |metric| {
        metric.value_of(reading).map(|value| MetricSample {
            metric,
            labels: labels.clone(),
            value,
        })
    })
}

fn identity(device: &Value, field: &str) -> Option<String> {
    device
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}
