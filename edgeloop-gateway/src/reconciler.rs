// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Config reconciliation
//!
//! The [`Reconciler`] drives running components towards the latest config
//! version, one version at a time and all-or-nothing:
//!
//! 1. validate the candidate and diff it against the active pipeline set
//! 2. stop removed pipelines, restart changed ones, start added ones,
//!    journalling every step
//! 3. watch the affected instances for the health window
//! 4. on success swap in the new snapshot and cache it; on any apply error
//!    or health regression replay the journal backwards
//!
//! The active config is always the latest version whose health was
//! confirmed, published as an immutable `Arc<GatewayConfig>` snapshot.
//!
//! A control-plane outage raises one warning when it begins and an info
//! line when it ends. A served config that does not parse is reported
//! upstream as rejected, once per distinct error.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use edgeloop::{
    Alert, AlertSeverity, ConfigCache, ConfigDiff, GatewayConfig, GatewayError, PipelineConfig,
    Result,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::clock::Clock;
use crate::control_plane::{ControlPlane, ReconcileReport, StatusReport};
use crate::settings::GatewaySettings;
use crate::supervisor::{InstanceState, Supervisor};

/// Result of one reconciliation attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Version not newer than the active one, or already rejected
    Unchanged,
    Applied { version: u64 },
    /// Applied, then reverted after an apply error or health regression
    RolledBack { version: u64, reason: String },
    /// Failed validation; nothing was touched
    Rejected { version: u64, reason: String },
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Applied { .. } => "applied",
            ReconcileOutcome::RolledBack { .. } => "rolled_back",
            ReconcileOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// One applied step, replayed backwards on rollback
#[derive(Debug, Clone)]
enum Step {
    Stopped(PipelineConfig),
    Started(PipelineConfig),
}

/// Top-level control loop owning the supervisor
pub struct Reconciler {
    supervisor: Supervisor,
    control_plane: Arc<dyn ControlPlane>,
    cache: ConfigCache,
    settings: GatewaySettings,
    clock: Clock,
    alerts: AlertSink,
    /// `None` until the first version is confirmed
    active: Option<Arc<GatewayConfig>>,
    config_tx: watch::Sender<Arc<GatewayConfig>>,
    /// Rejected or rolled-back versions above the active one
    rejected: BTreeSet<u64>,
    /// Start of the current control-plane outage
    outage_since: Option<u64>,
    /// Last parse error reported for the served config
    unparseable: Option<String>,
    pending: Option<GatewayConfig>,
    shutdown_seen: bool,
}

impl Reconciler {
    pub fn new(
        supervisor: Supervisor,
        control_plane: Arc<dyn ControlPlane>,
        cache: ConfigCache,
        settings: GatewaySettings,
        clock: Clock,
        alerts: AlertSink,
    ) -> Self {
        let (config_tx, _) =
            watch::channel(Arc::new(GatewayConfig::empty(settings.gateway_id.clone())));
        Self {
            supervisor,
            control_plane,
            cache,
            settings,
            clock,
            alerts,
            active: None,
            config_tx,
            rejected: BTreeSet::new(),
            outage_since: None,
            unparseable: None,
            pending: None,
            shutdown_seen: false,
        }
    }

    /// Receiver of the active config snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<GatewayConfig>> {
        self.config_tx.subscribe()
    }

    pub fn active(&self) -> Option<Arc<GatewayConfig>> {
        self.active.clone()
    }

    /// Versions that will not be retried
    pub fn rejected_versions(&self) -> Vec<u64> {
        self.rejected.iter().copied().collect()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    /// Choose the initial config: the newer of fetched and cached
    ///
    /// Fails only when the control plane is unreachable and nothing is cached.
    /// A corrupted cache is an invariant violation and is propagated.
    pub async fn bootstrap(&mut self) -> Result<Option<u64>> {
        let fetched = self.control_plane.fetch_config(&self.settings.gateway_id).await;
        let cached = self.cache.load()?;

        let initial = match (fetched, cached) {
            (Err(e), None) => {
                return Err(GatewayError::ControlPlaneUnreachable(format!(
                    "no cached config and control plane unavailable: {}",
                    e
                )));
            }
            (Err(e), Some(cached)) => {
                warn!(error = %e, version = cached.version, "control plane unreachable, starting from cache");
                Some(cached)
            }
            (Ok(Some(fetched)), Some(cached)) if cached.version > fetched.version => Some(cached),
            (Ok(fetched), cached) => fetched.or(cached),
        };

        let version = initial.as_ref().map(|c| c.version);
        info!(version = ?version, "bootstrap config selected");
        self.pending = initial;
        Ok(version)
    }

    /// Fetch the latest config; `None` if unreachable, unassigned or unparseable
    pub async fn pull(&mut self) -> Option<GatewayConfig> {
        match self.control_plane.fetch_config(&self.settings.gateway_id).await {
            Ok(config) => {
                self.end_outage();
                self.unparseable = None;
                config
            }
            Err(GatewayError::Config(reason)) => {
                self.end_outage();
                self.reject_unparseable(reason).await;
                None
            }
            Err(e) => {
                self.begin_outage(&e).await;
                None
            }
        }
    }

    async fn begin_outage(&mut self, e: &GatewayError) {
        if self.outage_since.is_some() {
            debug!(error = %e, "config pull skipped, control plane still unreachable");
            return;
        }
        let now = self.clock.now_ms();
        self.outage_since = Some(now);
        let active = self.active.as_ref().map(|c| c.version).unwrap_or(0);
        self.alerts
            .raise(Alert::new(
                now,
                AlertSeverity::Warning,
                "reconciler",
                format!("control plane unreachable, keeping config v{}: {}", active, e),
            ))
            .await;
    }

    fn end_outage(&mut self) {
        if let Some(since) = self.outage_since.take() {
            info!(
                outage_ms = self.clock.now_ms().saturating_sub(since),
                "control plane reachable again"
            );
        }
    }

    async fn reject_unparseable(&mut self, reason: String) {
        if self.unparseable.as_ref() == Some(&reason) {
            debug!(error = %reason, "served config still unparseable");
            return;
        }
        warn!(error = %reason, "served config rejected");
        self.alerts
            .raise(Alert::new(
                self.clock.now_ms(),
                AlertSeverity::Warning,
                "reconciler",
                format!("served config rejected: {}", reason),
            ))
            .await;
        // The version is unknown when the document does not parse
        let outcome = ReconcileOutcome::Rejected {
            version: 0,
            reason: reason.clone(),
        };
        self.report(&outcome).await;
        self.unparseable = Some(reason);
    }

    /// Reconcile to `new`, watching health for the full window
    pub async fn reconcile(&mut self, new: GatewayConfig) -> ReconcileOutcome {
        let (_keep_open, mut never) = broadcast::channel(1);
        self.reconcile_with(new, &mut never).await
    }

    async fn reconcile_with(
        &mut self,
        new: GatewayConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ReconcileOutcome {
        let version = new.version;
        let active_version = self.active.as_ref().map(|c| c.version);
        if active_version.is_some_and(|v| version <= v) || self.rejected.contains(&version) {
            debug!(version, active = ?active_version, "config not newer, ignoring");
            return ReconcileOutcome::Unchanged;
        }

        if let Err(e) = self.check(&new) {
            let reason = e.to_string();
            warn!(version, error = %reason, "config rejected");
            self.rejected.insert(version);
            self.alerts
                .raise(Alert::new(
                    self.clock.now_ms(),
                    AlertSeverity::Warning,
                    "reconciler",
                    format!("config v{} rejected: {}", version, reason),
                ))
                .await;
            let outcome = ReconcileOutcome::Rejected { version, reason };
            self.report(&outcome).await;
            return outcome;
        }

        let diff = self.diff_against_running(&new);
        info!(
            version,
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            added = diff.added.len(),
            "applying config"
        );

        let mut journal = Vec::new();
        let regression = match self.apply(&diff, &mut journal).await {
            Err(e) => Some(format!("apply failed: {}", e)),
            Ok(()) => self.watch_health(&diff.affected_ids(), shutdown).await,
        };

        let outcome = match regression {
            Some(reason) => {
                error!(version, reason = %reason, "rolling back config");
                self.revert(journal).await;
                self.rejected.insert(version);
                self.alerts
                    .raise(Alert::new(
                        self.clock.now_ms(),
                        AlertSeverity::Critical,
                        "reconciler",
                        format!("config v{} rolled back: {}", version, reason),
                    ))
                    .await;
                ReconcileOutcome::RolledBack { version, reason }
            }
            None => {
                self.commit(new);
                ReconcileOutcome::Applied { version }
            }
        };
        self.report(&outcome).await;
        outcome
    }

    fn check(&self, new: &GatewayConfig) -> Result<()> {
        if new.gateway_id != self.settings.gateway_id {
            return Err(GatewayError::Config(format!(
                "config is for gateway '{}', not '{}'",
                new.gateway_id, self.settings.gateway_id
            )));
        }
        new.validate()
    }

    /// Diff against the active set; identical pipelines sitting in FAILED are restarted
    fn diff_against_running(&self, new: &GatewayConfig) -> ConfigDiff {
        let running: &[PipelineConfig] = match &self.active {
            Some(active) => &active.pipelines,
            None => &[],
        };
        let mut diff = ConfigDiff::between(running, &new.pipelines);
        for pipeline in &new.pipelines {
            let unchanged = running.iter().any(|r| r == pipeline);
            let failed = self.supervisor.state(&pipeline.pipeline_id) == Some(InstanceState::Failed);
            if unchanged && failed {
                diff.changed.push((pipeline.clone(), pipeline.clone()));
            }
        }
        diff
    }

    async fn apply(&mut self, diff: &ConfigDiff, journal: &mut Vec<Step>) -> Result<()> {
        for old in &diff.removed {
            self.stop_step(old, journal).await?;
        }
        for (old, new) in &diff.changed {
            self.stop_step(old, journal).await?;
            self.start_step(new, journal).await?;
        }
        for new in &diff.added {
            self.start_step(new, journal).await?;
        }
        Ok(())
    }

    async fn stop_step(&mut self, pipeline: &PipelineConfig, journal: &mut Vec<Step>) -> Result<()> {
        let now = self.clock.now_ms();
        if let Some(stopped) = self.supervisor.stop(&pipeline.pipeline_id, now).await? {
            journal.push(Step::Stopped(stopped));
        }
        Ok(())
    }

    async fn start_step(&mut self, pipeline: &PipelineConfig, journal: &mut Vec<Step>) -> Result<()> {
        let now = self.clock.now_ms();
        self.supervisor.start(pipeline, now).await?;
        journal.push(Step::Started(pipeline.clone()));
        Ok(())
    }

    async fn revert(&mut self, journal: Vec<Step>) {
        for step in journal.into_iter().rev() {
            let now = self.clock.now_ms();
            let result = match &step {
                Step::Started(p) => self.supervisor.stop(&p.pipeline_id, now).await.map(|_| ()),
                Step::Stopped(p) => self.supervisor.start(p, now).await,
            };
            if let Err(e) = result {
                error!(step = ?step, error = %e, "rollback step failed");
            }
        }
    }

    /// Sweep affected instances until the deadline; `Some(reason)` on regression
    async fn watch_health(
        &mut self,
        affected: &[String],
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<String> {
        if affected.is_empty() {
            return None;
        }
        let baseline: BTreeMap<String, u32> = affected
            .iter()
            .filter_map(|id| {
                self.supervisor
                    .instance(id)
                    .map(|i| (id.clone(), i.generation()))
            })
            .collect();

        let deadline = Instant::now() + self.settings.health_window;
        let period = self.settings.sweep_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {
                    self.supervisor.sweep(self.clock.now_ms()).await;
                    if let Some(reason) = self.regression(&baseline, false) {
                        return Some(reason);
                    }
                }
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => {
                        // Cancelled monitoring commits what was applied
                        self.shutdown_seen = true;
                        return None;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                },
            }
        }

        self.supervisor.sweep(self.clock.now_ms()).await;
        self.regression(&baseline, true)
    }

    fn regression(&self, baseline: &BTreeMap<String, u32>, at_deadline: bool) -> Option<String> {
        for (id, generation) in baseline {
            let Some(instance) = self.supervisor.instance(id) else {
                return Some(format!("{} disappeared", id));
            };
            match instance.state() {
                InstanceState::Crashed | InstanceState::Failed => {
                    return Some(format!("{} is {}", id, instance.state().as_str()));
                }
                InstanceState::Starting if at_deadline => {
                    return Some(format!("{} not ready within the health window", id));
                }
                _ if instance.generation() > *generation => {
                    return Some(format!("{} restarted during the health window", id));
                }
                _ => {}
            }
        }
        None
    }

    fn commit(&mut self, new: GatewayConfig) {
        if let Err(e) = self.cache.store(&new) {
            warn!(version = new.version, error = %e, "failed to cache config");
        }
        let snapshot = Arc::new(new);
        info!(version = snapshot.version, "config active");
        let active = snapshot.version;
        self.rejected.retain(|v| *v > active);
        self.active = Some(Arc::clone(&snapshot));
        self.config_tx.send_replace(snapshot);
    }

    async fn report(&self, outcome: &ReconcileOutcome) {
        let (attempted_version, detail) = match outcome {
            ReconcileOutcome::Unchanged => return,
            ReconcileOutcome::Applied { version } => (*version, String::new()),
            ReconcileOutcome::RolledBack { version, reason }
            | ReconcileOutcome::Rejected { version, reason } => (*version, reason.clone()),
        };
        let report = StatusReport {
            gateway_id: self.settings.gateway_id.clone(),
            at_ms: self.clock.now_ms(),
            active_version: self.active.as_ref().map(|c| c.version).unwrap_or(0),
            health: None,
            reconciliation: Some(ReconcileReport {
                attempted_version,
                outcome: outcome.as_str().to_string(),
                detail,
            }),
        };
        if let Err(e) = self
            .control_plane
            .post_status(&self.settings.gateway_id, &report)
            .await
        {
            debug!(error = %e, "reconciliation report not delivered");
        }
    }

    async fn poll_once(&mut self, shutdown: &mut broadcast::Receiver<()>) {
        if let Some(config) = self.pull().await {
            self.reconcile_with(config, shutdown).await;
        }
    }

    /// Run until shutdown: periodic pulls, push notifications and supervisor sweeps
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>, mut push: mpsc::Receiver<()>) {
        if let Some(initial) = self.pending.take() {
            self.reconcile_with(initial, &mut shutdown).await;
        }

        let mut pull = interval(self.settings.reconcile_interval);
        pull.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown_seen {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = pull.tick() => self.poll_once(&mut shutdown).await,
                Some(()) = push.recv() => {
                    debug!("config push notification");
                    self.poll_once(&mut shutdown).await;
                }
                _ = sweep.tick() => self.supervisor.sweep(self.clock.now_ms()).await,
            }
        }

        info!("reconciler shutting down, stopping all instances");
        self.supervisor.stop_all(self.clock.now_ms()).await;
    }
}
