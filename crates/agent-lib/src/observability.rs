//! Observability infrastructure for the usage agent
//!
//! Provides:
//! - Prometheus metrics (tick latency, local workloads, samples, errors, CPU share)
//! - Structured lifecycle logging with tracing

use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for a collection tick (in seconds)
const TICK_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    ticks: IntCounter,
    tick_latency_seconds: Histogram,
    local_workloads: IntGauge,
    samples_sent: IntCounterVec,
    read_errors: IntCounterVec,
    send_errors: IntCounter,
    workload_cpu_percent: GaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            ticks: register_int_counter!(
                "usage_agent_ticks_total",
                "Number of collection ticks started"
            )
            .expect("Failed to register ticks_total"),

            tick_latency_seconds: register_histogram!(
                "usage_agent_tick_latency_seconds",
                "Time spent enumerating local workloads for a tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            local_workloads: register_int_gauge!(
                "usage_agent_local_workloads",
                "Number of workloads placed on this host at the last tick"
            )
            .expect("Failed to register local_workloads"),

            samples_sent: register_int_counter_vec!(
                "usage_agent_samples_sent_total",
                "Samples written to the collector",
                &["kind"]
            )
            .expect("Failed to register samples_sent_total"),

            read_errors: register_int_counter_vec!(
                "usage_agent_read_errors_total",
                "Accounting reads that failed, excluding terminated workloads",
                &["kind"]
            )
            .expect("Failed to register read_errors_total"),

            send_errors: register_int_counter!(
                "usage_agent_send_errors_total",
                "Samples dropped because the collector write failed"
            )
            .expect("Failed to register send_errors_total"),

            workload_cpu_percent: register_gauge_vec!(
                "usage_agent_workload_cpu_percent",
                "CPU utilisation per workload between the last two samples",
                &["workload"]
            )
            .expect("Failed to register workload_cpu_percent"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// A lightweight handle to the process-wide metrics; clones share the same
/// underlying collectors.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Record a finished tick
    ///
    /// `None` leaves the local workload gauge at its last known value.
    pub fn observe_tick(&self, duration_secs: f64, local_workloads: Option<usize>) {
        let inner = self.inner();
        inner.ticks.inc();
        inner.tick_latency_seconds.observe(duration_secs);
        if let Some(count) = local_workloads {
            inner.local_workloads.set(count as i64);
        }
    }

    pub fn inc_samples_sent(&self, kind: &str) {
        self.inner().samples_sent.with_label_values(&[kind]).inc();
    }

    pub fn inc_read_errors(&self, kind: &str) {
        self.inner().read_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_send_errors(&self) {
        self.inner().send_errors.inc();
    }

    pub fn set_workload_cpu_percent(&self, workload_id: &str, percent: f64) {
        self.inner()
            .workload_cpu_percent
            .with_label_values(&[workload_id])
            .set(percent);
    }

    pub fn remove_workload(&self, workload_id: &str) {
        let _ = self
            .inner()
            .workload_cpu_percent
            .remove_label_values(&[workload_id]);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> prometheus::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Structured logger for agent lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    hostname: String,
}

impl StructuredLogger {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    pub fn log_startup(&self, version: &str, collector_addr: &str, interval_secs: u64) {
        info!(
            event = "agent_started",
            host = %self.hostname,
            agent_version = %version,
            collector = %collector_addr,
            interval_secs = interval_secs,
            "Usage agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str, drained: bool) {
        info!(
            event = "agent_shutdown",
            host = %self.hostname,
            reason = %reason,
            drained = drained,
            "Usage agent shutting down"
        );
    }

    /// Log the outcome of a configuration reload
    pub fn log_reload(&self, result: &anyhow::Result<()>) {
        match result {
            Ok(()) => info!(
                event = "config_reloaded",
                host = %self.hostname,
                "Configuration re-read"
            ),
            Err(e) => warn!(
                event = "config_reload_failed",
                host = %self.hostname,
                error = %e,
                "Configuration reload failed, keeping current settings"
            ),
        }
    }
}
