// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Component supervision
//!
//! The [`Supervisor`] is the single owner and sole writer of every
//! [`ComponentInstance`]. Other units see a read-only [`InstanceTable`]
//! published through a `watch` channel after each change.
//!
//! ```text
//! STARTING ──▶ RUNNING ◀──▶ DEGRADED
//!    ▲            │             │
//!    │            ▼             ▼
//!    └──────── CRASHED ──▶ FAILED (budget exhausted)
//!
//! RUNNING / DEGRADED ──▶ STOPPING ──▶ STOPPED
//! ```
//!
//! Every runtime call is bounded by a timeout and probes run concurrently,
//! so a hung component is seen as missed probes and never blocks the loop.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use edgeloop::{
    Alert, AlertSeverity, CircuitStatus, ComponentKind, GatewayError, PipelineConfig, Result,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::runtime::{ComponentProbe, ContainerRuntime, ContainerSpec, InstanceHandle, Readiness, RuntimeState};
use crate::settings::GatewaySettings;

/// Lifecycle state of a component instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Starting,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Crashed,
    /// Restart budget exhausted; only reconciliation or an operator revives it
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::Degraded => "DEGRADED",
            InstanceState::Stopping => "STOPPING",
            InstanceState::Stopped => "STOPPED",
            InstanceState::Crashed => "CRASHED",
            InstanceState::Failed => "FAILED",
        }
    }

    /// Serving traffic, possibly degraded
    pub fn is_up(&self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Degraded)
    }

    pub fn all() -> [InstanceState; 7] {
        [
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Degraded,
            InstanceState::Stopping,
            InstanceState::Stopped,
            InstanceState::Crashed,
            InstanceState::Failed,
        ]
    }
}

/// Rolling-window restart budget
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window_ms: u64,
    restarts: VecDeque<u64>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window_ms: window.as_millis() as u64,
            restarts: VecDeque::new(),
        }
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some(&oldest) = self.restarts.front() {
            if now_ms.saturating_sub(oldest) >= self.window_ms {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Restarts within the window ending at `now_ms`
    pub fn used(&mut self, now_ms: u64) -> u32 {
        self.prune(now_ms);
        self.restarts.len() as u32
    }

    /// Consume one restart if the budget allows
    pub fn try_consume(&mut self, now_ms: u64) -> bool {
        self.prune(now_ms);
        if (self.restarts.len() as u32) < self.max_restarts {
            self.restarts.push_back(now_ms);
            true
        } else {
            false
        }
    }
}

/// Read-only view of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub pipeline_id: String,
    pub kind: ComponentKind,
    pub critical: bool,
    pub state: InstanceState,
    pub restarts_in_window: u32,
    pub missed_probes: u32,
    pub circuit: CircuitStatus,
    pub last_error: Option<String>,
    pub last_check_ms: Option<u64>,
    pub started_at_ms: u64,
}

/// Instances keyed by pipeline id
pub type InstanceTable = BTreeMap<String, InstanceSnapshot>;

/// Runtime record of a supervised component
#[derive(Debug)]
pub struct ComponentInstance {
    pipeline: PipelineConfig,
    generation: u32,
    state: InstanceState,
    handle: Option<InstanceHandle>,
    budget: RestartBudget,
    missed_probes: u32,
    circuit: CircuitStatus,
    last_error: Option<String>,
    last_check_ms: Option<u64>,
    started_at_ms: u64,
}

impl ComponentInstance {
    pub fn instance_id(&self) -> String {
        format!("{}-{}", self.pipeline.pipeline_id, self.generation)
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Incremented on every restart
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    fn snapshot(&mut self, now_ms: u64) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_id: self.instance_id(),
            pipeline_id: self.pipeline.pipeline_id.clone(),
            kind: self.pipeline.kind,
            critical: self.pipeline.critical,
            state: self.state,
            restarts_in_window: self.budget.used(now_ms),
            missed_probes: self.missed_probes,
            circuit: self.circuit,
            last_error: self.last_error.clone(),
            last_check_ms: self.last_check_ms,
            started_at_ms: self.started_at_ms,
        }
    }
}

/// Result of probing one instance during a sweep
#[derive(Debug)]
enum ProbeOutcome {
    Exited(String),
    Answered(ComponentProbe),
    Missed(String),
}

/// Owns the lifecycle of every component instance
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    settings: GatewaySettings,
    instances: BTreeMap<String, ComponentInstance>,
    table_tx: watch::Sender<Arc<InstanceTable>>,
    alerts: AlertSink,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: GatewaySettings,
        alerts: AlertSink,
    ) -> Self {
        let (table_tx, _) = watch::channel(Arc::new(InstanceTable::new()));
        Self {
            runtime,
            settings,
            instances: BTreeMap::new(),
            table_tx,
            alerts,
        }
    }

    /// Receiver of the published instance table
    pub fn subscribe(&self) -> watch::Receiver<Arc<InstanceTable>> {
        self.table_tx.subscribe()
    }

    pub fn state(&self, pipeline_id: &str) -> Option<InstanceState> {
        self.instances.get(pipeline_id).map(|i| i.state)
    }

    pub fn instance(&self, pipeline_id: &str) -> Option<&ComponentInstance> {
        self.instances.get(pipeline_id)
    }

    /// Pipeline configs of every supervised instance, in id order
    pub fn pipelines(&self) -> Vec<PipelineConfig> {
        self.instances.values().map(|i| i.pipeline.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn publish(&mut self, now_ms: u64) {
        let table: InstanceTable = self
            .instances
            .iter_mut()
            .map(|(id, inst)| (id.clone(), inst.snapshot(now_ms)))
            .collect();
        self.table_tx.send_replace(Arc::new(table));
    }

    async fn launch(&self, pipeline: &PipelineConfig) -> Result<InstanceHandle> {
        let spec = ContainerSpec::for_pipeline(pipeline)?;
        match timeout(self.settings.start_timeout, self.runtime.start(&spec)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ComponentTimeout {
                instance: spec.name,
                timeout_ms: self.settings.start_timeout.as_millis() as u64,
            }),
        }
    }

    /// Start a new instance for `pipeline`, in STARTING state
    pub async fn start(&mut self, pipeline: &PipelineConfig, now_ms: u64) -> Result<()> {
        if self.instances.contains_key(&pipeline.pipeline_id) {
            return Err(GatewayError::Config(format!(
                "pipeline '{}' is already supervised",
                pipeline.pipeline_id
            )));
        }
        let handle = self.launch(pipeline).await?;
        info!(
            pipeline = %pipeline.pipeline_id,
            image = %pipeline.image,
            "instance starting"
        );
        self.instances.insert(
            pipeline.pipeline_id.clone(),
            ComponentInstance {
                pipeline: pipeline.clone(),
                generation: 0,
                state: InstanceState::Starting,
                handle: Some(handle),
                budget: RestartBudget::new(
                    self.settings.restart_budget,
                    self.settings.restart_window,
                ),
                missed_probes: 0,
                circuit: CircuitStatus::default(),
                last_error: None,
                last_check_ms: None,
                started_at_ms: now_ms,
            },
        );
        self.publish(now_ms);
        Ok(())
    }

    /// Stop and forget an instance; returns the config it ran
    pub async fn stop(&mut self, pipeline_id: &str, now_ms: u64) -> Result<Option<PipelineConfig>> {
        let Some(instance) = self.instances.get_mut(pipeline_id) else {
            return Ok(None);
        };
        let previous = instance.state;
        instance.state = InstanceState::Stopping;
        let handle = instance.handle.take();
        self.publish(now_ms);

        if let Some(handle) = handle {
            let grace = self.settings.stop_grace;
            let bound = grace + self.settings.probe_timeout;
            let result = match timeout(bound, self.runtime.stop(&handle, grace)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::ComponentTimeout {
                    instance: handle.name.clone(),
                    timeout_ms: bound.as_millis() as u64,
                }),
            };
            if let Err(e) = result {
                if let Some(instance) = self.instances.get_mut(pipeline_id) {
                    instance.state = previous;
                    instance.handle = Some(handle);
                    instance.last_error = Some(e.to_string());
                }
                self.publish(now_ms);
                return Err(e);
            }
        }

        let removed = self.instances.remove(pipeline_id).map(|mut i| {
            i.state = InstanceState::Stopped;
            i.pipeline
        });
        info!(pipeline = %pipeline_id, "instance stopped");
        self.publish(now_ms);
        Ok(removed)
    }

    /// Probe every live instance and apply crash, timeout and ceiling policy
    pub async fn sweep(&mut self, now_ms: u64) {
        let mut probes = JoinSet::new();
        for (id, instance) in &self.instances {
            let Some(handle) = instance.handle.clone() else {
                continue;
            };
            if !matches!(
                instance.state,
                InstanceState::Starting | InstanceState::Running | InstanceState::Degraded
            ) {
                continue;
            }
            let runtime = Arc::clone(&self.runtime);
            let probe_timeout = self.settings.probe_timeout;
            let id = id.clone();
            probes.spawn(async move {
                let outcome = probe_instance(runtime, handle, probe_timeout).await;
                (id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        for (id, outcome) in outcomes {
            self.apply_probe(&id, outcome, now_ms).await;
        }

        // Retry instances whose restart could not be launched
        let crashed: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, i)| i.state == InstanceState::Crashed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in crashed {
            self.restart_or_fail(&id, now_ms).await;
        }

        self.publish(now_ms);
    }

    async fn apply_probe(&mut self, id: &str, outcome: ProbeOutcome, now_ms: u64) {
        let limit = self.settings.missed_probe_limit;
        let probe_timeout_ms = self.settings.probe_timeout.as_millis() as u64;
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };

        match outcome {
            ProbeOutcome::Exited(reason) => {
                let err = GatewayError::ComponentCrash {
                    instance: instance.instance_id(),
                    reason,
                };
                self.crash(id, err, now_ms).await;
            }
            ProbeOutcome::Missed(reason) => {
                instance.missed_probes += 1;
                debug!(pipeline = %id, missed = instance.missed_probes, reason = %reason, "probe missed");
                if instance.missed_probes >= limit {
                    let err = GatewayError::ComponentTimeout {
                        instance: instance.instance_id(),
                        timeout_ms: probe_timeout_ms * u64::from(limit),
                    };
                    self.kill(id).await;
                    self.crash(id, err, now_ms).await;
                }
            }
            ProbeOutcome::Answered(probe) => {
                instance.missed_probes = 0;
                instance.last_check_ms = Some(now_ms);
                instance.circuit = probe.circuit;
                let ceiling = instance.pipeline.limits.memory_bytes;
                if probe.memory_bytes.is_some_and(|used| used > ceiling) {
                    let err = GatewayError::ComponentCrash {
                        instance: instance.instance_id(),
                        reason: format!(
                            "memory {} bytes exceeds ceiling {} bytes",
                            probe.memory_bytes.unwrap_or_default(),
                            ceiling
                        ),
                    };
                    self.kill(id).await;
                    self.crash(id, err, now_ms).await;
                    return;
                }
                let next = match (probe.readiness, probe.circuit_open()) {
                    (Readiness::Ready, false) => InstanceState::Running,
                    (Readiness::Ready, true) => InstanceState::Degraded,
                    (Readiness::Starting, _) if instance.state == InstanceState::Starting => {
                        InstanceState::Starting
                    }
                    (Readiness::Starting, _) => InstanceState::Degraded,
                };
                if next != instance.state {
                    info!(
                        pipeline = %id,
                        from = instance.state.as_str(),
                        to = next.as_str(),
                        "instance state changed"
                    );
                    instance.state = next;
                }
            }
        }
    }

    /// Force-stop a misbehaving instance before treating it as crashed
    async fn kill(&mut self, id: &str) {
        let Some(handle) = self.instances.get_mut(id).and_then(|i| i.handle.take()) else {
            return;
        };
        let bound = self.settings.probe_timeout;
        match timeout(bound, self.runtime.stop(&handle, Duration::ZERO)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(pipeline = %id, error = %e, "failed to kill instance"),
            Err(_) => warn!(pipeline = %id, "kill timed out"),
        }
    }

    async fn crash(&mut self, id: &str, err: GatewayError, now_ms: u64) {
        if let Some(instance) = self.instances.get_mut(id) {
            warn!(pipeline = %id, error = %err, "instance crashed");
            instance.state = InstanceState::Crashed;
            instance.handle = None;
            instance.last_error = Some(err.to_string());
        }
        self.publish(now_ms);
        self.restart_or_fail(id, now_ms).await;
    }

    async fn restart_or_fail(&mut self, id: &str, now_ms: u64) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if !instance.budget.try_consume(now_ms) {
            instance.state = InstanceState::Failed;
            let severity = if instance.pipeline.critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Warning
            };
            let message = format!(
                "{} FAILED: restart budget of {} per {}s exhausted ({})",
                instance.instance_id(),
                self.settings.restart_budget,
                self.settings.restart_window.as_secs(),
                instance.last_error.as_deref().unwrap_or("unknown")
            );
            self.publish(now_ms);
            self.alerts
                .raise(Alert::new(now_ms, severity, "supervisor", message))
                .await;
            return;
        }

        let pipeline = instance.pipeline.clone();
        match self.launch(&pipeline).await {
            Ok(handle) => {
                if let Some(instance) = self.instances.get_mut(id) {
                    instance.generation += 1;
                    instance.handle = Some(handle);
                    instance.state = InstanceState::Starting;
                    instance.missed_probes = 0;
                    instance.started_at_ms = now_ms;
                    info!(
                        pipeline = %id,
                        instance = %instance.instance_id(),
                        restarts = instance.budget.used(now_ms),
                        "instance restarted"
                    );
                }
            }
            Err(e) => {
                warn!(pipeline = %id, error = %e, "restart failed");
                if let Some(instance) = self.instances.get_mut(id) {
                    instance.last_error = Some(e.to_string());
                }
            }
        }
        self.publish(now_ms);
    }

    /// Stop every instance concurrently, each within the grace period
    pub async fn stop_all(&mut self, now_ms: u64) {
        let grace = self.settings.stop_grace;
        let bound = grace + self.settings.probe_timeout;
        let mut stops = JoinSet::new();
        for (id, instance) in self.instances.iter_mut() {
            instance.state = InstanceState::Stopping;
            if let Some(handle) = instance.handle.take() {
                let runtime = Arc::clone(&self.runtime);
                let id = id.clone();
                stops.spawn(async move {
                    let result = timeout(bound, runtime.stop(&handle, grace)).await;
                    (id, result)
                });
            }
        }
        self.publish(now_ms);
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((id, Ok(Ok(())))) => info!(pipeline = %id, "instance stopped"),
                Ok((id, Ok(Err(e)))) => warn!(pipeline = %id, error = %e, "stop failed"),
                Ok((id, Err(_))) => warn!(pipeline = %id, "stop timed out"),
                Err(e) => warn!(error = %e, "stop task failed"),
            }
        }
        self.instances.clear();
        self.publish(now_ms);
    }
}

async fn probe_instance(
    runtime: Arc<dyn ContainerRuntime>,
    handle: InstanceHandle,
    probe_timeout: Duration,
) -> ProbeOutcome {
    match timeout(probe_timeout, runtime.inspect(&handle)).await {
        Ok(Ok(RuntimeState::Running)) => {}
        Ok(Ok(RuntimeState::Exited { code, oom_killed })) => {
            return ProbeOutcome::Exited(if oom_killed {
                format!("killed at memory ceiling (exit {})", code)
            } else {
                format!("exited with code {}", code)
            });
        }
        Ok(Ok(RuntimeState::Missing)) => {
            return ProbeOutcome::Exited("container disappeared".to_string())
        }
        Ok(Err(e)) => return ProbeOutcome::Missed(e.to_string()),
        Err(_) => return ProbeOutcome::Missed("inspect timed out".to_string()),
    }
    match timeout(probe_timeout, runtime.probe(&handle)).await {
        Ok(Ok(probe)) => ProbeOutcome::Answered(probe),
        Ok(Err(e)) => ProbeOutcome::Missed(e.to_string()),
        Err(_) => ProbeOutcome::Missed("health check timed out".to_string()),
    }
}
