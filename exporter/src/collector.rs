use crate::errors::{CycleError, FetchError};
use crate::mapper::map_devices;
use crate::metrics::{
    CYCLES_TOTAL, CYCLE_DURATION_SECONDS, CYCLE_FAILURES_TOTAL, DEVICES_PUBLISHED,
    LAST_SUCCESS_TIMESTAMP, MAPPING_FAILURES_TOTAL,
};
use crate::registry::MetricRegistry;
use crate::telemetry::TelemetrySource;
use crate::token::TokenStore;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Where a cycle currently is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    FetchingToken,
    FetchingData,
    Mapping,
    Publishing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::FetchingToken => "fetching_token",
            Phase::FetchingData => "fetching_data",
            Phase::Mapping => "mapping",
            Phase::Publishing => "publishing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cycle that was abandoned, and the phase it was in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleFailure {
    pub phase: Phase,
    pub error: CycleError,
}

impl CycleFailure {
    fn new(phase: Phase, error: impl Into<CycleError>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle failed while {}: {}", self.phase, self.error)
    }
}

impl std::error::Error for CycleFailure {}

/// What a successful cycle published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub devices: usize,
    pub samples: usize,
    pub skipped_devices: usize,
    pub token_refreshed_on_rejection: bool,
}

pub struct Collector {
    tokens: Arc<TokenStore>,
    telemetry: Arc<dyn TelemetrySource>,
    registry: Arc<MetricRegistry>,
}

impl Collector {
    pub fn new(
        tokens: Arc<TokenStore>,
        telemetry: Arc<dyn TelemetrySource>,
        registry: Arc<MetricRegistry>,
    ) -> Self {
        Self {
            tokens,
            telemetry,
            registry,
        }
    }

    /// Runs one token → fetch → map → publish pass. Nothing is written to the
    /// registry unless every step before publishing succeeded.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleFailure> {
        let mut report = CycleReport::default();

        debug!("Cycle phase: {}", Phase::FetchingToken);
        let credential = self
            .tokens
            .ensure_valid()
            .await
            .map_err(|e| CycleFailure::new(Phase::FetchingToken, e))?;

        debug!("Cycle phase: {}", Phase::FetchingData);
        let devices = match self.telemetry.fetch(&credential.access_token).await {
            Ok(devices) => devices,
            Err(FetchError::AuthRejected(status)) => {
                warn!(
                    "Access token rejected (HTTP {}), forcing a refresh and retrying once",
                    status
                );
                report.token_refreshed_on_rejection = true;
                let fresh = self
                    .tokens
                    .force_refresh(&credential.access_token)
                    .await
                    .map_err(|e| CycleFailure::new(Phase::FetchingToken, e))?;
                self.telemetry
                    .fetch(&fresh.access_token)
                    .await
                    .map_err(|e| CycleFailure::new(Phase::FetchingData, e))?
            }
            Err(e) => return Err(CycleFailure::new(Phase::FetchingData, e)),
        };

        debug!("Cycle phase: {}", Phase::Mapping);
        let outcome = map_devices(&devices);
        for failure in &outcome.failures {
            warn!("Skipping device: {}", failure);
        }
        MAPPING_FAILURES_TOTAL.inc_by(outcome.failures.len() as f64);

        debug!("Cycle phase: {}", Phase::Publishing);
        self.registry.replace_all(&outcome.samples);

        report.devices = outcome.devices;
        report.samples = outcome.samples.len();
        report.skipped_devices = outcome.failures.len();
        Ok(report)
    }

    /// Runs one cycle and records its outcome. Never returns an error: a
    /// failed cycle leaves the published values as they were.
    pub async fn tick(&self) -> Option<CycleReport> {
        CYCLES_TOTAL.inc();
        let start = Instant::now();
        let result = self.run_cycle().await;
        CYCLE_DURATION_SECONDS.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                self.tokens.mark_healthy();
                DEVICES_PUBLISHED.set(report.devices as i64);
                LAST_SUCCESS_TIMESTAMP.set(Utc::now().timestamp() as f64);
                info!(
                    "Published {} samples from {} devices ({} skipped) in {:.3}s",
                    report.samples,
                    report.devices,
                    report.skipped_devices,
                    start.elapsed().as_secs_f64()
                );
                Some(report)
            }
            Err(failure) => {
                let kind = match &failure.error {
                    CycleError::Auth(e) => e.kind(),
                    CycleError::Fetch(e) => e.kind(),
                };
                CYCLE_FAILURES_TOTAL
                    .with_label_values(&[failure.phase.as_str(), kind])
                    .inc();

                match &failure.error {
                    CycleError::Auth(e) if e.is_permanent() => error!(
                        "{}; re-authorization required, keeping last known metrics",
                        failure
                    ),
                    _ => warn!("{}; keeping last known metrics", failure),
                }
                None
            }
        }
    }

    /// Ticks every `period`, starting immediately. Ticks that fall due while
    /// a cycle is still running are dropped; the next cycle starts one full
    /// period after the overrunning one finished.
    pub async fn run(self, period: Duration) {
        info!("Starting collector with interval={:?}", period);

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let scheduled = ticker.tick().await;
            debug!("Cycle phase: {}", Phase::Idle);
            self.tick().await;

            let overrun = scheduled.elapsed();
            if overrun >= period {
                warn!(
                    "Cycle took {:?}, longer than the {:?} interval; skipping the overdue tick",
                    overrun, period
                );
                ticker.reset();
            }
        }
    }
}
