use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CYCLES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "netatmo_exporter_cycles_total",
        "Total collection cycles started"
    ))
    .unwrap();
    pub static ref CYCLE_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "netatmo_exporter_cycle_failures_total",
            "Total collection cycles aborted, by phase and error kind"
        ),
        &["phase", "kind"]
    )
    .unwrap();
    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "netatmo_exporter_token_refreshes_total",
            "Total refresh-token exchanges, by outcome"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref MAPPING_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "netatmo_exporter_mapping_failures_total",
        "Total device entries dropped because they lacked identity fields"
    ))
    .unwrap();
    pub static ref DEVICES_PUBLISHED: IntGauge = IntGauge::with_opts(Opts::new(
        "netatmo_exporter_devices",
        "Devices mapped in the last successful cycle"
    ))
    .unwrap();
    pub static ref LAST_SUCCESS_TIMESTAMP: Gauge = Gauge::with_opts(Opts::new(
        "netatmo_exporter_last_success_timestamp_seconds",
        "Unix time of the last successful collection cycle"
    ))
    .unwrap();
    pub static ref CYCLE_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "netatmo_exporter_cycle_duration_seconds",
            "Time taken by one collection cycle"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    )
    .unwrap();
    pub static ref REAUTHORIZATION_REQUIRED: IntGauge = IntGauge::with_opts(Opts::new(
        "netatmo_exporter_reauthorization_required",
        "1 when the identity endpoint permanently rejected the stored credential"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(CYCLES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CYCLE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TOKEN_REFRESHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MAPPING_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DEVICES_PUBLISHED.clone()))?;
    REGISTRY.register(Box::new(LAST_SUCCESS_TIMESTAMP.clone()))?;
    REGISTRY.register(Box::new(CYCLE_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(REAUTHORIZATION_REQUIRED.clone()))?;
    Ok(())
}
