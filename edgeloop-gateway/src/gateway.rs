// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway assembly
//!
//! [`Gateway::start`] wires every unit together and spawns each one as its
//! own tokio task:
//!
//! ```text
//! Reconciler (owns Supervisor) ──config──▶ stream manager ──▶ ValidatorWorker per raw stream
//!        │                                                   AggregatorWorker
//!        └──instances──▶ HealthReporter ◀──tier── Governor   DecisionWorker
//!                                                            ExportPump per destination
//! ```
//!
//! Units share only `watch` snapshots. One broadcast channel carries the
//! shutdown signal; [`GatewayHandle::shutdown`] waits for every task, which
//! includes the orderly stop of all supervised components.

use std::collections::BTreeMap;
use std::sync::Arc;

use edgeloop::{
    Alert, ConfigCache, DurableLog, GatewayConfig, HealthRollup, ReadingCodec, Result,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::clock::Clock;
use crate::control_plane::{ControlPlane, GuardedControlPlane};
use crate::export::{Destination, ExportPump, PumpStatus};
use crate::health_reporter::HealthReporter;
use crate::overflow::{GovernorStatus, OverflowGovernor};
use crate::reconciler::Reconciler;
use crate::runtime::ContainerRuntime;
use crate::settings::GatewaySettings;
use crate::supervisor::{InstanceTable, Supervisor};
use crate::workers::{AggregatorWorker, DecisionWorker, PipelineStats, SharedStats, ValidatorWorker};

/// Everything a gateway needs before it starts
pub struct Gateway {
    settings: GatewaySettings,
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    runtime: Arc<dyn ContainerRuntime>,
    control_plane: Arc<dyn ControlPlane>,
    cache: ConfigCache,
    exports: Vec<(String, Arc<dyn Destination>)>,
    clock: Clock,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        log: Arc<dyn DurableLog>,
        codec: ReadingCodec,
        runtime: Arc<dyn ContainerRuntime>,
        control_plane: Arc<dyn ControlPlane>,
        cache: ConfigCache,
    ) -> Self {
        Self {
            settings,
            log,
            codec,
            runtime,
            control_plane,
            cache,
            exports: Vec::new(),
            clock: Clock::new(),
        }
    }

    /// Export `topic` to `destination` through a circuit-guarded pump
    pub fn with_export(mut self, topic: impl Into<String>, destination: Arc<dyn Destination>) -> Self {
        self.exports.push((topic.into(), destination));
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Bootstrap the config and spawn every unit
    ///
    /// Fails when the control plane is unreachable and no config is cached,
    /// or when local state is corrupted.
    pub async fn start(self) -> Result<GatewayHandle> {
        let Gateway {
            settings,
            log,
            codec,
            runtime,
            control_plane,
            cache,
            exports,
            clock,
        } = self;

        let alerts = AlertSink::new(Arc::clone(&log), codec.clone());
        let guarded: Arc<dyn ControlPlane> = Arc::new(GuardedControlPlane::new(
            control_plane,
            settings.circuit.clone(),
            clock,
        ));

        let supervisor = Supervisor::new(runtime, settings.clone(), alerts.clone());
        let instances = supervisor.subscribe();
        let mut reconciler = Reconciler::new(
            supervisor,
            Arc::clone(&guarded),
            cache,
            settings.clone(),
            clock,
            alerts.clone(),
        );
        let bootstrap_version = reconciler.bootstrap().await?;
        let config = reconciler.subscribe();

        let (shutdown_tx, _) = broadcast::channel(16);
        let (push_tx, push_rx) = mpsc::channel(8);
        let stats = SharedStats::default();
        let mut tasks = Vec::new();

        let governor = OverflowGovernor::new(
            Arc::clone(&log),
            codec.clone(),
            alerts.clone(),
            config.clone(),
            clock,
        );
        let governor_rx = governor.subscribe();
        let pumps: Vec<ExportPump> = exports
            .into_iter()
            .map(|(topic, destination)| {
                ExportPump::new(Arc::clone(&log), topic, destination, settings.circuit.clone())
                    .with_batch(settings.worker_batch)
                    .with_alerts(alerts.clone())
            })
            .collect();
        let export_rx: Vec<_> = pumps.iter().map(ExportPump::subscribe).collect();
        let reporter = HealthReporter::new(
            settings.gateway_id.clone(),
            instances.clone(),
            governor_rx.clone(),
            config.clone(),
            Arc::clone(&log),
            codec.clone(),
            Some(guarded),
            clock,
        )
        .with_exports(export_rx.clone());
        let health = reporter.subscribe();

        tasks.push(tokio::spawn(reconciler.run(shutdown_tx.subscribe(), push_rx)));
        tasks.push(tokio::spawn(
            governor.run(settings.governor_interval, shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            reporter.run(settings.report_interval, shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            AggregatorWorker::new(
                Arc::clone(&log),
                codec.clone(),
                config.clone(),
                stats.clone(),
                clock,
            )
            .with_batch(settings.worker_batch)
            .run(settings.worker_interval, shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            DecisionWorker::new(Arc::clone(&log), codec.clone(), stats.clone(), clock)
                .run(settings.worker_interval, shutdown_tx.subscribe()),
        ));
        for pump in pumps {
            tasks.push(tokio::spawn(pump.run(
                clock,
                settings.worker_interval,
                shutdown_tx.subscribe(),
            )));
        }
        let manager = StreamManager {
            log: Arc::clone(&log),
            codec,
            config: config.clone(),
            stats: stats.clone(),
            clock,
            settings: settings.clone(),
            workers: BTreeMap::new(),
        };
        tasks.push(tokio::spawn(manager.run(shutdown_tx.subscribe())));

        info!(
            gateway = %settings.gateway_id,
            bootstrap_version = ?bootstrap_version,
            "gateway started"
        );
        Ok(GatewayHandle {
            shutdown: shutdown_tx,
            notifier: ConfigNotifier { push: push_tx },
            view: GatewayView {
                config,
                instances,
                governor: governor_rx,
                health,
                exports: export_rx,
                stats,
                alerts,
            },
            tasks,
        })
    }
}

/// Starts and stops one validator worker per raw stream of the active config
struct StreamManager {
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    config: watch::Receiver<Arc<GatewayConfig>>,
    stats: SharedStats,
    clock: Clock,
    settings: GatewaySettings,
    workers: BTreeMap<String, (broadcast::Sender<()>, JoinHandle<()>)>,
}

impl StreamManager {
    fn sync(&mut self) {
        let wanted = self.config.borrow_and_update().raw_streams();
        let stale: Vec<String> = self
            .workers
            .keys()
            .filter(|s| !wanted.contains(s))
            .cloned()
            .collect();
        for stream in stale {
            if let Some((stop, _)) = self.workers.remove(&stream) {
                info!(stream = %stream, "raw stream retired, stopping validator");
                let _ = stop.send(());
            }
        }
        for stream in wanted {
            if self.workers.contains_key(&stream) {
                continue;
            }
            let (stop, stop_rx) = broadcast::channel(1);
            let worker = ValidatorWorker::new(
                stream.clone(),
                Arc::clone(&self.log),
                self.codec.clone(),
                self.config.clone(),
                Arc::clone(&self.stats),
                self.clock,
            )
            .with_batch(self.settings.worker_batch);
            let handle = tokio::spawn(worker.run(self.settings.worker_interval, stop_rx));
            self.workers.insert(stream, (stop, handle));
        }
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        self.sync();
        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                changed = self.config.changed() => match changed {
                    Ok(()) => self.sync(),
                    Err(_) => break,
                },
            }
        }
        for (stream, (stop, handle)) in std::mem::take(&mut self.workers) {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                warn!(stream = %stream, error = %e, "validator worker panicked");
            }
        }
        debug!("stream manager stopped");
    }
}

/// Read-only view of a running gateway
#[derive(Clone)]
pub struct GatewayView {
    config: watch::Receiver<Arc<GatewayConfig>>,
    instances: watch::Receiver<Arc<InstanceTable>>,
    governor: watch::Receiver<GovernorStatus>,
    health: watch::Receiver<HealthRollup>,
    exports: Vec<watch::Receiver<PumpStatus>>,
    stats: SharedStats,
    alerts: AlertSink,
}

impl GatewayView {
    /// Active (health-confirmed) config
    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.borrow().clone()
    }

    pub fn instances(&self) -> Arc<InstanceTable> {
        self.instances.borrow().clone()
    }

    pub fn governor(&self) -> GovernorStatus {
        *self.governor.borrow()
    }

    pub fn health(&self) -> HealthRollup {
        self.health.borrow().clone()
    }

    /// Circuit and counters of every export pump
    pub fn exports(&self) -> Vec<PumpStatus> {
        self.exports.iter().map(|rx| rx.borrow().clone()).collect()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.read().clone()
    }

    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.alerts.recent()
    }

    pub fn subscribe_config(&self) -> watch::Receiver<Arc<GatewayConfig>> {
        self.config.clone()
    }

    pub fn subscribe_instances(&self) -> watch::Receiver<Arc<InstanceTable>> {
        self.instances.clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthRollup> {
        self.health.clone()
    }
}

/// Push channel from the control plane into the reconciler
#[derive(Clone)]
pub struct ConfigNotifier {
    push: mpsc::Sender<()>,
}

impl ConfigNotifier {
    /// Ask the reconciler to pull the config now; coalesced if one is pending
    pub fn notify(&self) {
        if self.push.try_send(()).is_err() {
            debug!("config pull already pending");
        }
    }
}

/// Handle on a running gateway
pub struct GatewayHandle {
    shutdown: broadcast::Sender<()>,
    notifier: ConfigNotifier,
    view: GatewayView,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayHandle {
    pub fn view(&self) -> GatewayView {
        self.view.clone()
    }

    pub fn notifier(&self) -> ConfigNotifier {
        self.notifier.clone()
    }

    /// Push notification from the control plane: pull the config now
    pub fn notify_config_change(&self) {
        self.notifier.notify();
    }

    /// Signal every unit and wait until all of them stopped
    pub async fn shutdown(self) {
        info!("gateway shutting down");
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "gateway task panicked");
            }
        }
        info!("gateway stopped");
    }
}
