use crate::errors::Result;
use crate::metrics;
use crate::model::{MetricKind, MetricSample};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

const LABELS: [&str; 3] = ["station_name", "address_mac", "city"];

/// Current value of every sensor series, served on `/metrics`.
///
/// Writers take the gate exclusively for a whole batch and readers take it
/// shared while gathering, so a scrape sees either the previous batch or the
/// new one in full. Series are never removed: a device that stops reporting
/// keeps its last value.
pub struct MetricRegistry {
    registry: Registry,
    gauges: HashMap<MetricKind, GaugeVec>,
    gate: RwLock<()>,
}

impl MetricRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let mut gauges = HashMap::with_capacity(MetricKind::ALL.len());

        for kind in MetricKind::ALL {
            let gauge = GaugeVec::new(Opts::new(kind.metric_name(), kind.help()), &LABELS)?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.insert(kind, gauge);
        }

        Ok(Self {
            registry,
            gauges,
            gate: RwLock::new(()),
        })
    }

    /// Applies a batch, overwriting the value of each sample's series.
    pub fn replace_all(&self, samples: &[MetricSample]) {
        let _guard = self.gate.write().unwrap_or_else(PoisonError::into_inner);

        for sample in samples {
            if let Some(gauge) = self.gauges.get(&sample.metric) {
                gauge
                    .with_label_values(&sample.labels.as_values())
                    .set(sample.value);
            }
        }
    }

    /// Sensor families only, copied under the read gate.
    pub fn gather(&self) -> Vec<MetricFamily> {
        let _guard = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.registry.gather()
    }

    /// Text exposition of sensor series followed by the exporter's own metrics.
    pub fn snapshot(&self) -> Result<String> {
        let mut families = self.gather();
        families.extend(metrics::REGISTRY.gather());

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn series_count(&self) -> usize {
        self.gather()
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }
}
