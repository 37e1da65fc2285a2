// Edgeloop Daemon - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the gateway control loop.
//!
//! Gauges are refreshed from a [`GatewayView`] on every scrape, so they always
//! reflect the latest published snapshots.

use edgeloop::{CircuitState, HealthStatus};
use edgeloop_gateway::{GatewayView, InstanceState, PipelineStats, PumpStatus};
use lazy_static::lazy_static;
use prometheus::{register_gauge, register_gauge_vec, Encoder, Gauge, GaugeVec, TextEncoder};
use tracing::warn;

lazy_static! {
    // ============================================================
    // Gateway roll-up
    // ============================================================

    /// Gateway status: 0 = healthy, 1 = degraded, 2 = unhealthy, 3 = offline
    pub static ref GATEWAY_STATUS: Gauge = register_gauge!(
        "edgeloop_gateway_status",
        "Gateway status (0=Healthy, 1=Degraded, 2=Unhealthy, 3=Offline)"
    ).unwrap();

    /// Version of the active config
    pub static ref CONFIG_VERSION: Gauge = register_gauge!(
        "edgeloop_config_version",
        "Version of the active gateway config"
    ).unwrap();

    /// Overflow tier, 1 to 5
    pub static ref OVERFLOW_TIER: Gauge = register_gauge!(
        "edgeloop_overflow_tier",
        "Overflow governor tier (1=Normal .. 5=Block)"
    ).unwrap();

    pub static ref STORAGE_USED_PCT: Gauge = register_gauge!(
        "edgeloop_storage_used_percent",
        "Local storage used, percent of capacity"
    ).unwrap();

    pub static ref LOG_BLOCKED: Gauge = register_gauge!(
        "edgeloop_log_blocked",
        "Whether the log rejects non-critical writes (1=blocked)"
    ).unwrap();

    // ============================================================
    // Supervised components
    // ============================================================

    pub static ref INSTANCES: GaugeVec = register_gauge_vec!(
        "edgeloop_instances",
        "Supervised component instances by state",
        &["state"]
    ).unwrap();

    /// Circuit state per pipeline: 0 = closed, 1 = half-open, 2 = open
    pub static ref CIRCUIT_STATE: GaugeVec = register_gauge_vec!(
        "edgeloop_circuit_state",
        "Circuit breaker state reported by a component (0=Closed, 1=HalfOpen, 2=Open)",
        &["pipeline"]
    ).unwrap();

    pub static ref RESTARTS_IN_WINDOW: GaugeVec = register_gauge_vec!(
        "edgeloop_restarts_in_window",
        "Restarts of a pipeline inside the restart budget window",
        &["pipeline"]
    ).unwrap();

    // ============================================================
    // Export
    // ============================================================

    /// Circuit state per destination: 0 = closed, 1 = half-open, 2 = open
    pub static ref EXPORT_CIRCUIT_STATE: GaugeVec = register_gauge_vec!(
        "edgeloop_export_circuit_state",
        "Circuit breaker state of an export pump (0=Closed, 1=HalfOpen, 2=Open)",
        &["destination"]
    ).unwrap();

    pub static ref EXPORT_RECORDS: GaugeVec = register_gauge_vec!(
        "edgeloop_export_records_total",
        "Records handled by an export pump by outcome",
        &["destination", "outcome"]
    ).unwrap();

    pub static ref EXPORT_FAILED_WRITES: GaugeVec = register_gauge_vec!(
        "edgeloop_export_failed_writes_total",
        "Failed batch writes of an export pump",
        &["destination"]
    ).unwrap();

    // ============================================================
    // Data quality
    // ============================================================

    pub static ref READINGS_TOTAL: GaugeVec = register_gauge_vec!(
        "edgeloop_readings_total",
        "Validated readings by quality code",
        &["quality"]
    ).unwrap();

    pub static ref DEAD_LETTERS_TOTAL: GaugeVec = register_gauge_vec!(
        "edgeloop_dead_letters_total",
        "Readings routed to the dead-letter stream by reason",
        &["reason"]
    ).unwrap();

    pub static ref GAP_EVENTS_TOTAL: Gauge = register_gauge!(
        "edgeloop_gap_events_total",
        "Gap events emitted by the validators"
    ).unwrap();

    pub static ref WINDOWS_FLUSHED_TOTAL: Gauge = register_gauge!(
        "edgeloop_windows_flushed_total",
        "Aggregate windows emitted, revisions included"
    ).unwrap();

    pub static ref LATE_DROPPED_TOTAL: Gauge = register_gauge!(
        "edgeloop_late_readings_dropped_total",
        "Late readings whose window was already closed"
    ).unwrap();

    pub static ref DECISIONS_TOTAL: GaugeVec = register_gauge_vec!(
        "edgeloop_deadletter_decisions_total",
        "Operator decisions applied to dead-letter entries",
        &["decision"]
    ).unwrap();

    pub static ref ALERTS_RECENT: GaugeVec = register_gauge_vec!(
        "edgeloop_alerts_recent",
        "Alerts held in the recent-alert buffer by severity",
        &["severity"]
    ).unwrap();
}

pub fn status_value(status: HealthStatus) -> f64 {
    match status {
        HealthStatus::Healthy => 0.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Unhealthy => 2.0,
        HealthStatus::Offline => 3.0,
    }
}

pub fn circuit_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

/// Refresh data-quality counters from the worker statistics
pub fn update_pipeline_stats(stats: &PipelineStats) {
    let (mut good, mut suspect, mut uncertain, mut bad) = (0, 0, 0, 0);
    let (mut range, mut invalid, mut gaps) = (0, 0, 0);
    for v in stats.validators.values() {
        good += v.good;
        suspect += v.suspect;
        uncertain += v.uncertain;
        bad += v.bad;
        range += v.range_violations;
        invalid += v.invalid_values;
        gaps += v.gaps;
    }
    READINGS_TOTAL.with_label_values(&["good"]).set(good as f64);
    READINGS_TOTAL.with_label_values(&["suspect"]).set(suspect as f64);
    READINGS_TOTAL.with_label_values(&["uncertain"]).set(uncertain as f64);
    READINGS_TOTAL.with_label_values(&["bad"]).set(bad as f64);
    DEAD_LETTERS_TOTAL
        .with_label_values(&["range_violation"])
        .set(range as f64);
    DEAD_LETTERS_TOTAL
        .with_label_values(&["invalid_value"])
        .set(invalid as f64);
    GAP_EVENTS_TOTAL.set(gaps as f64);
    WINDOWS_FLUSHED_TOTAL.set(stats.aggregator.flushed as f64);
    LATE_DROPPED_TOTAL.set(stats.aggregator.late_dropped as f64);
    DECISIONS_TOTAL
        .with_label_values(&["approve"])
        .set(stats.approved as f64);
    DECISIONS_TOTAL
        .with_label_values(&["discard"])
        .set(stats.discarded as f64);
}

/// Refresh export gauges from the pump snapshots
pub fn update_exports(exports: &[PumpStatus]) {
    for pump in exports {
        let name = pump.destination.as_str();
        EXPORT_CIRCUIT_STATE
            .with_label_values(&[name])
            .set(circuit_value(pump.circuit.state));
        EXPORT_RECORDS
            .with_label_values(&[name, "written"])
            .set(pump.stats.written as f64);
        EXPORT_RECORDS
            .with_label_values(&[name, "dropped"])
            .set(pump.stats.dropped as f64);
        EXPORT_FAILED_WRITES
            .with_label_values(&[name])
            .set(pump.stats.failed_writes as f64);
    }
}

/// Refresh every gauge from the gateway snapshots
pub fn update_from_view(view: &GatewayView) {
    let health = view.health();
    GATEWAY_STATUS.set(status_value(health.status));
    CONFIG_VERSION.set(view.config().version as f64);

    let governor = view.governor();
    OVERFLOW_TIER.set(f64::from(governor.tier));
    STORAGE_USED_PCT.set(governor.usage_pct);
    LOG_BLOCKED.set(if governor.blocked { 1.0 } else { 0.0 });

    let instances = view.instances();
    for state in InstanceState::all() {
        let count = instances.values().filter(|i| i.state == state).count();
        INSTANCES
            .with_label_values(&[state.as_str()])
            .set(count as f64);
    }
    // Pipelines removed from the config must not linger
    CIRCUIT_STATE.reset();
    RESTARTS_IN_WINDOW.reset();
    for (pipeline, instance) in instances.iter() {
        CIRCUIT_STATE
            .with_label_values(&[pipeline.as_str()])
            .set(circuit_value(instance.circuit.state));
        RESTARTS_IN_WINDOW
            .with_label_values(&[pipeline.as_str()])
            .set(f64::from(instance.restarts_in_window));
    }

    update_pipeline_stats(&view.stats());
    update_exports(&view.exports());

    ALERTS_RECENT.reset();
    for alert in view.recent_alerts() {
        ALERTS_RECENT
            .with_label_values(&[alert.severity.as_str()])
            .inc();
    }
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
