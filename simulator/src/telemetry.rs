use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};

const CITIES: [&str; 4] = ["Paris", "Lyon", "Nantes", "Lille"];
const ROOMS: [&str; 6] = ["Kitchen", "Bedroom", "Living room", "Office", "Nursery", "Attic"];

/// A simulated Home Coach, stable across polls apart from its readings.
#[derive(Debug, Clone)]
pub struct Station {
    pub mac: String,
    pub name: String,
    pub city: &'static str,
}

impl Station {
    pub fn fleet(count: usize) -> Vec<Station> {
        (0..count)
            .map(|i| Station {
                mac: format!("70:ee:50:00:{:02x}:{:02x}", i / 256, i % 256),
                name: format!("{} {}", ROOMS[i % ROOMS.len()], i / ROOMS.len() + 1),
                city: CITIES[i % CITIES.len()],
            })
            .collect()
    }

    /// Device entry as returned by `gethomecoachsdata`. With probability
    /// `gap_rate` a measurement is left out, and with half that probability
    /// the station is reported unreachable (no `dashboard_data` at all).
    pub fn reading(&self, rng: &mut impl Rng, gap_rate: f64) -> Value {
        let gap_rate = if gap_rate.is_nan() { 0.0 } else { gap_rate.clamp(0.0, 1.0) };
        let mut device = json!({
            "_id": self.mac,
            "station_name": self.name,
            "type": "NHC",
            "reachable": true,
            "place": { "city": self.city, "country": "FR", "timezone": "Europe/Paris" },
            "wifi_status": rng.gen_range(30..90),
        });

        if rng.gen_bool(gap_rate / 2.0) {
            device["reachable"] = json!(false);
            return device;
        }

        let mut dashboard = serde_json::Map::new();
        dashboard.insert("time_utc".into(), json!(Utc::now().timestamp()));
        let measurements = [
            ("Temperature", json!((rng.gen_range(16.0..27.0_f64) * 10.0).round() / 10.0)),
            ("Humidity", json!(rng.gen_range(30..70))),
            ("CO2", json!(rng.gen_range(400..1800))),
            ("Noise", json!(rng.gen_range(30..70))),
            ("Pressure", json!((rng.gen_range(990.0..1030.0_f64) * 10.0).round() / 10.0)),
            ("AbsolutePressure", json!((rng.gen_range(985.0..1025.0_f64) * 10.0).round() / 10.0)),
            ("health_idx", json!(rng.gen_range(0..5))),
        ];
        for (field, value) in measurements {
            if !rng.gen_bool(gap_rate) {
                dashboard.insert(field.into(), value);
            }
        }
        device["dashboard_data"] = Value::Object(dashboard);
        device
    }
}
