// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway health roll-up
//!
//! Reads the supervisor's instance table, the governor's tier and the export
//! pumps' circuits, rolls them into one [`HealthRollup`], and publishes it on a fixed interval and on
//! every status transition: to `gateway.health`, to the control plane, and to
//! a local `watch` channel served by the daemon's HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use edgeloop::schema::HEALTH_SUBJECT;
use edgeloop::{
    roll_up, topics, CircuitState, DurableLog, GatewayConfig, HealthCheck, HealthRollup,
    HealthStatus, ReadingCodec,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::control_plane::{ControlPlane, StatusReport};
use crate::export::PumpStatus;
use crate::overflow::GovernorStatus;
use crate::supervisor::{InstanceSnapshot, InstanceState, InstanceTable};

/// Per-component check derived from one instance snapshot
pub fn check_for(instance: &InstanceSnapshot) -> HealthCheck {
    let id = &instance.pipeline_id;
    let state = instance.state.as_str();
    let check = match instance.state {
        InstanceState::Running => HealthCheck::healthy(id, state),
        InstanceState::Degraded if instance.circuit.state == CircuitState::Open => {
            HealthCheck::degraded(id, state, "circuit open, data held in the log")
        }
        InstanceState::Degraded => HealthCheck::degraded(id, state, "not ready"),
        InstanceState::Starting | InstanceState::Stopping | InstanceState::Stopped => {
            HealthCheck::degraded(id, state, "in transition")
        }
        // Restart pending within the budget
        InstanceState::Crashed => HealthCheck::degraded(
            id,
            state,
            instance.last_error.as_deref().unwrap_or("exited, restarting"),
        ),
        InstanceState::Failed => HealthCheck::unhealthy(
            id,
            state,
            instance.last_error.as_deref().unwrap_or("exited"),
        ),
    };
    check.critical(instance.critical)
}

/// Non-critical check for one export destination
pub fn check_for_export(pump: &PumpStatus) -> HealthCheck {
    let id = format!("export.{}", pump.destination);
    let state = pump.circuit.state.as_str();
    match pump.circuit.state {
        CircuitState::Closed => HealthCheck::healthy(id, state),
        CircuitState::Open => HealthCheck::degraded(
            id,
            state,
            format!("circuit open, {} held in the log", pump.topic),
        ),
        CircuitState::HalfOpen => HealthCheck::degraded(id, state, "probing destination"),
    }
}

/// Compose a roll-up from the current observations
pub fn compose(
    gateway_id: &str,
    config_version: u64,
    table: &InstanceTable,
    exports: &[PumpStatus],
    governor: GovernorStatus,
    now_ms: u64,
) -> HealthRollup {
    let components: Vec<HealthCheck> = table
        .values()
        .map(check_for)
        .chain(exports.iter().map(check_for_export))
        .collect();
    HealthRollup {
        gateway_id: gateway_id.to_string(),
        status: roll_up(&components, governor.tier),
        config_version,
        overflow_tier: governor.tier,
        storage_used_pct: governor.usage_pct,
        components,
        generated_at_ms: now_ms,
    }
}

/// Publishes the gateway roll-up
pub struct HealthReporter {
    gateway_id: String,
    instances: watch::Receiver<Arc<InstanceTable>>,
    governor: watch::Receiver<GovernorStatus>,
    config: watch::Receiver<Arc<GatewayConfig>>,
    exports: Vec<watch::Receiver<PumpStatus>>,
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    control_plane: Option<Arc<dyn ControlPlane>>,
    clock: Clock,
    rollup_tx: watch::Sender<HealthRollup>,
    last_status: Option<HealthStatus>,
}

impl HealthReporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway_id: impl Into<String>,
        instances: watch::Receiver<Arc<InstanceTable>>,
        governor: watch::Receiver<GovernorStatus>,
        config: watch::Receiver<Arc<GatewayConfig>>,
        log: Arc<dyn DurableLog>,
        codec: ReadingCodec,
        control_plane: Option<Arc<dyn ControlPlane>>,
        clock: Clock,
    ) -> Self {
        let gateway_id = gateway_id.into();
        let initial = compose(
            &gateway_id,
            0,
            &InstanceTable::new(),
            &[],
            GovernorStatus::default(),
            clock.now_ms(),
        );
        let (rollup_tx, _) = watch::channel(initial);
        Self {
            gateway_id,
            instances,
            governor,
            config,
            exports: Vec::new(),
            log,
            codec,
            control_plane,
            clock,
            rollup_tx,
            last_status: None,
        }
    }

    /// Include the circuits of these export pumps in the roll-up
    pub fn with_exports(mut self, exports: Vec<watch::Receiver<PumpStatus>>) -> Self {
        self.exports = exports;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthRollup> {
        self.rollup_tx.subscribe()
    }

    /// Roll-up of the current observations, without publishing
    pub fn current(&self) -> HealthRollup {
        let table = self.instances.borrow().clone();
        let governor = *self.governor.borrow();
        let version = self.config.borrow().version;
        let exports: Vec<PumpStatus> = self.exports.iter().map(|rx| rx.borrow().clone()).collect();
        compose(
            &self.gateway_id,
            version,
            &table,
            &exports,
            governor,
            self.clock.now_ms(),
        )
    }

    /// Publish the current roll-up everywhere
    pub async fn publish(&mut self) -> HealthRollup {
        let rollup = self.current();
        if self.last_status != Some(rollup.status) {
            info!(
                status = rollup.status.as_str(),
                previous = ?self.last_status.map(|s| s.as_str()),
                tier = rollup.overflow_tier,
                "gateway status changed"
            );
            self.last_status = Some(rollup.status);
        }
        self.rollup_tx.send_replace(rollup.clone());

        match self.codec.encode(HEALTH_SUBJECT, &rollup).await {
            Ok(payload) => {
                if let Err(e) = self.log.produce(topics::HEALTH, &self.gateway_id, payload).await {
                    debug!(error = %e, "health roll-up not appended");
                }
            }
            Err(e) => debug!(error = %e, "health roll-up not encoded"),
        }

        if let Some(control_plane) = &self.control_plane {
            let report = StatusReport {
                gateway_id: self.gateway_id.clone(),
                at_ms: rollup.generated_at_ms,
                active_version: rollup.config_version,
                health: Some(rollup.clone()),
                reconciliation: None,
            };
            if let Err(e) = control_plane.post_status(&self.gateway_id, &report).await {
                debug!(error = %e, "health roll-up not delivered upstream");
            }
        }
        rollup
    }

    async fn publish_on_transition(&mut self) {
        let status = self.current().status;
        if self.last_status != Some(status) {
            self.publish().await;
        }
    }

    /// Publish on the interval and on every status transition until shutdown
    pub async fn run(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = ticker.tick() => {
                    self.publish().await;
                }
                Ok(()) = self.instances.changed() => self.publish_on_transition().await,
                Ok(()) = self.governor.changed() => self.publish_on_transition().await,
            }
        }
        debug!("health reporter stopped");
    }
}
