//! Prometheus counters for the credit and generation pipeline.
//!
//! Rendered alongside the axum-prometheus HTTP metrics at `/internal/metrics`.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

const DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

#[derive(Clone)]
pub struct GenerationMetrics {
    registry: Registry,
    /// Reserve attempts by outcome: `reserved` or `insufficient`
    reservations_total: IntCounterVec,
    /// Applied settlements: `confirmed` or `cancelled`
    settlements_total: IntCounterVec,
    /// Costed work that succeeded but couldn't be billed
    settlement_failures_total: IntCounter,
    jobs_finished_total: IntCounterVec,
    generation_duration_seconds: HistogramVec,
}

impl GenerationMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reservations_total = IntCounterVec::new(
            Opts::new("stagectl_credit_reservations_total", "Credit reservation attempts"),
            &["outcome"],
        )?;
        registry.register(Box::new(reservations_total.clone()))?;

        let settlements_total = IntCounterVec::new(
            Opts::new("stagectl_credit_settlements_total", "Reservations settled"),
            &["kind"],
        )?;
        registry.register(Box::new(settlements_total.clone()))?;

        let settlement_failures_total = IntCounter::with_opts(Opts::new(
            "stagectl_credit_settlement_failures_total",
            "Successful operations whose reservation could not be confirmed",
        ))?;
        registry.register(Box::new(settlement_failures_total.clone()))?;

        let jobs_finished_total = IntCounterVec::new(
            Opts::new("stagectl_jobs_finished_total", "Transformation jobs reaching a terminal state"),
            &["status"],
        )?;
        registry.register(Box::new(jobs_finished_total.clone()))?;

        let generation_duration_seconds = HistogramVec::new(
            HistogramOpts::new("stagectl_generation_duration_seconds", "Time from processing to terminal state")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["status"],
        )?;
        registry.register(Box::new(generation_duration_seconds.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            reservations_total,
            settlements_total,
            settlement_failures_total,
            jobs_finished_total,
            generation_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_reservation(&self, outcome: &str) {
        self.reservations_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_settlement(&self, kind: &str) {
        self.settlements_total.with_label_values(&[kind]).inc();
    }

    pub fn record_settlement_failure(&self) {
        self.settlement_failures_total.inc();
    }

    pub fn record_job_finished(&self, status: &str, duration_ms: Option<i64>) {
        self.jobs_finished_total.with_label_values(&[status]).inc();
        if let Some(ms) = duration_ms {
            self.generation_duration_seconds
                .with_label_values(&[status])
                .observe(ms as f64 / 1000.0);
        }
    }

    /// Prometheus text exposition of this registry
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode generation metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
