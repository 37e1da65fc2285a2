// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Runtime tunables of the control loop

use std::time::Duration;

use edgeloop::CircuitConfig;

/// Timing and budget settings shared by the control-loop units
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Identity reported to the control plane
    pub gateway_id: String,
    /// Periodic config pull
    pub reconcile_interval: Duration,
    /// Post-change health monitoring window
    pub health_window: Duration,
    /// Supervisor sweep cadence (also used inside the health window)
    pub sweep_interval: Duration,
    /// Bound on one health probe of a component
    pub probe_timeout: Duration,
    /// Consecutive missed probes before a component counts as crashed
    pub missed_probe_limit: u32,
    /// Restarts allowed per instance within `restart_window`
    pub restart_budget: u32,
    pub restart_window: Duration,
    /// Grace period given to a component on stop
    pub stop_grace: Duration,
    /// Bound on a container start
    pub start_timeout: Duration,
    /// Breaker settings for every external connection
    pub circuit: CircuitConfig,
    /// Overflow governor poll cadence
    pub governor_interval: Duration,
    /// Health roll-up publish cadence
    pub report_interval: Duration,
    /// Stream worker poll cadence
    pub worker_interval: Duration,
    /// Records fetched per worker step
    pub worker_batch: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            gateway_id: "edgeloop".to_string(),
            reconcile_interval: Duration::from_secs(30),
            health_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            missed_probe_limit: 3,
            restart_budget: 5,
            restart_window: Duration::from_secs(300),
            stop_grace: Duration::from_secs(10),
            start_timeout: Duration::from_secs(30),
            circuit: CircuitConfig::default(),
            governor_interval: Duration::from_secs(10),
            report_interval: Duration::from_secs(15),
            worker_interval: Duration::from_millis(500),
            worker_batch: 500,
        }
    }
}

impl GatewaySettings {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            ..Default::default()
        }
    }

    pub fn with_health_window(mut self, health_window: Duration) -> Self {
        self.health_window = health_window;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_reconcile_interval(mut self, reconcile_interval: Duration) -> Self {
        self.reconcile_interval = reconcile_interval;
        self
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = GatewaySettings::new("gw-7");
        assert_eq!(s.gateway_id, "gw-7");
        assert_eq!(s.reconcile_interval, Duration::from_secs(30));
        assert_eq!(s.health_window, Duration::from_secs(60));
        assert_eq!(s.restart_budget, 5);
        assert_eq!(s.restart_window, Duration::from_secs(300));
        assert_eq!(s.circuit.failure_threshold, 5);
    }
}
