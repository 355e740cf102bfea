//! In-process counters for the message pipeline, mirrored onto the
//! `whatsapp_msg_total{status}` counter and `ai_processing_seconds`
//! histogram a Prometheus scraper reads from port 8001 (SPEC_FULL.md §6).
//!
//! The atomics below remain the source of truth `Worker`/tests read
//! synchronously; [`install_prometheus_exporter`] additionally mirrors every
//! recorded sample onto the `metrics` crate's global recorder so a real
//! deployment can scrape the same numbers over HTTP. Call it once, from
//! `main`, before any `Metrics::record_*` call — the `metrics` macros are a
//! safe no-op before a recorder is installed, which is what keeps the unit
//! tests below free of global state.

use crate::error::{Error, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

/// Port the Prometheus text endpoint listens on (SPEC_FULL.md §6).
pub const PROMETHEUS_PORT: u16 = 8001;

/// Installs the global Prometheus recorder and spawns its scrape-endpoint
/// HTTP listener on [`PROMETHEUS_PORT`]. Call exactly once per process.
pub fn install_prometheus_exporter() -> Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), PROMETHEUS_PORT);
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|error| Error::config(format!("installing prometheus exporter: {error}")))
}

/// Outcome label for `whatsapp_msg_total{status}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Delivered,
    Retried,
    DeadLettered,
}

impl MessageOutcome {
    fn status_label(self) -> &'static str {
        match self {
            MessageOutcome::Delivered => "delivered",
            MessageOutcome::Retried => "retried",
            MessageOutcome::DeadLettered => "dead_lettered",
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    processing_seconds_total_micros: AtomicU64,
    processing_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(&self, outcome: MessageOutcome) {
        let counter = match outcome {
            MessageOutcome::Delivered => &self.delivered,
            MessageOutcome::Retried => &self.retried,
            MessageOutcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("whatsapp_msg_total", "status" => outcome.status_label()).increment(1);
    }

    pub fn record_processing_time(&self, duration: std::time::Duration) {
        self.processing_seconds_total_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.processing_count.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("ai_processing_seconds").record(duration.as_secs_f64());
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Mean processing time in seconds across all recorded samples, or 0 if
    /// none have been recorded yet.
    pub fn mean_processing_seconds(&self) -> f64 {
        let count = self.processing_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total_micros = self.processing_seconds_total_micros.load(Ordering::Relaxed);
        (total_micros as f64 / count as f64) / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counts_outcomes_independently() {
        let metrics = Metrics::new();
        metrics.record_outcome(MessageOutcome::Delivered);
        metrics.record_outcome(MessageOutcome::Delivered);
        metrics.record_outcome(MessageOutcome::Retried);
        metrics.record_outcome(MessageOutcome::DeadLettered);

        assert_eq!(metrics.delivered(), 2);
        assert_eq!(metrics.retried(), 1);
        assert_eq!(metrics.dead_lettered(), 1);
    }

    #[test]
    fn mean_processing_time_with_no_samples_is_zero() {
        let metrics = Metrics::new();
        assert_eq!(metrics.mean_processing_seconds(), 0.0);
    }

    #[test]
    fn mean_processing_time_averages_samples() {
        let metrics = Metrics::new();
        metrics.record_processing_time(Duration::from_millis(100));
        metrics.record_processing_time(Duration::from_millis(300));
        let mean = metrics.mean_processing_seconds();
        assert!((mean - 0.2).abs() < 0.001);
    }
}
