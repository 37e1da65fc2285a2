// Edgeloop Gateway - Integration Tests
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Integration tests for reconciliation, supervision, overflow governance,
//! export and the assembled gateway. All async tests run on paused tokio time.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeloop::schema::{OVERFLOW_SUBJECT, READING_SUBJECT};
use edgeloop::{
    topics, Admission, AlertSeverity, CircuitState, CircuitStatus, ConfigCache, DurableLog,
    GatewayConfig, GatewayError, HealthStatus, MemoryLog, OverflowAction, OverflowEvent,
    ParameterRule, PipelineConfig, Reading, ReadingCodec, Record, Result, SchemaCache,
    TopicPriority,
};
use edgeloop_gateway::*;
use parking_lot::Mutex;
use tokio::sync::watch;

const GATEWAY: &str = "plant-7";
const T0: u64 = 1_700_000_000_000;

// ============================================================================
// Fakes
// ============================================================================

/// Container runtime whose behaviour is selected by image name:
/// `crash` exits immediately, `broken` fails to start, `hang` never answers
/// probes, `oom` reports memory above any ceiling, `open-circuit` reports an
/// open breaker. Sabotaged containers exit whatever their image.
#[derive(Default)]
struct FakeRuntime {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    running: BTreeMap<String, String>,
    starts: Vec<String>,
    stops: Vec<String>,
    sabotaged: BTreeSet<String>,
    next_id: u64,
}

impl FakeRuntime {
    fn starts(&self) -> Vec<String> {
        self.state.lock().starts.clone()
    }

    fn stops(&self) -> Vec<String> {
        self.state.lock().stops.clone()
    }

    fn running(&self) -> Vec<String> {
        self.state.lock().running.keys().cloned().collect()
    }

    fn sabotage(&self, name: &str) {
        self.state.lock().sabotaged.insert(name.to_string());
    }

    fn heal(&self, name: &str) {
        self.state.lock().sabotaged.remove(name);
    }

    fn image_of(&self, handle: &InstanceHandle) -> Option<String> {
        self.state.lock().running.get(&handle.name).cloned()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<InstanceHandle> {
        if spec.image.contains("broken") {
            return Err(GatewayError::Runtime(format!("image {} not found", spec.image)));
        }
        let mut state = self.state.lock();
        state.next_id += 1;
        state.running.insert(spec.name.clone(), spec.image.clone());
        state.starts.push(spec.name.clone());
        Ok(InstanceHandle {
            id: format!("c{}", state.next_id),
            name: spec.name.clone(),
        })
    }

    async fn stop(&self, handle: &InstanceHandle, _grace: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.running.remove(&handle.name);
        state.stops.push(handle.name.clone());
        Ok(())
    }

    async fn inspect(&self, handle: &InstanceHandle) -> Result<RuntimeState> {
        if self.state.lock().sabotaged.contains(&handle.name) {
            return Ok(RuntimeState::Exited {
                code: 137,
                oom_killed: false,
            });
        }
        Ok(match self.image_of(handle) {
            None => RuntimeState::Missing,
            Some(image) if image.contains("crash") => RuntimeState::Exited {
                code: 1,
                oom_killed: false,
            },
            Some(_) => RuntimeState::Running,
        })
    }

    async fn probe(&self, handle: &InstanceHandle) -> Result<ComponentProbe> {
        let image = self.image_of(handle).unwrap_or_default();
        if image.contains("hang") {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let mut probe = ComponentProbe::ready();
        if image.contains("oom") {
            probe.memory_bytes = Some(64 << 30);
        }
        if image.contains("open-circuit") {
            probe.circuit = CircuitStatus {
                state: CircuitState::Open,
                consecutive_failures: 5,
                open_until_ms: None,
            };
        }
        Ok(probe)
    }
}

#[derive(Default)]
struct FakeControlPlane {
    config: Mutex<Option<GatewayConfig>>,
    unreachable: AtomicBool,
    /// Serve a document that does not parse
    garbled: AtomicBool,
    reports: Mutex<Vec<StatusReport>>,
}

impl FakeControlPlane {
    fn serving(config: GatewayConfig) -> Self {
        let cp = Self::default();
        *cp.config.lock() = Some(config);
        cp
    }

    fn down() -> Self {
        let cp = Self::default();
        cp.unreachable.store(true, Ordering::SeqCst);
        cp
    }

    fn outcomes(&self) -> Vec<String> {
        self.reports
            .lock()
            .iter()
            .filter_map(|r| r.reconciliation.as_ref().map(|x| x.outcome.clone()))
            .collect()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn fetch_config(&self, _gateway_id: &str) -> Result<Option<GatewayConfig>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::ControlPlaneUnreachable("no route".into()));
        }
        if self.garbled.load(Ordering::SeqCst) {
            return GatewayConfig::from_json("{ \"version\": ").map(Some);
        }
        Ok(self.config.lock().clone())
    }

    async fn post_status(&self, _gateway_id: &str, report: &StatusReport) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::ControlPlaneUnreachable("no route".into()));
        }
        self.reports.lock().push(report.clone());
        Ok(())
    }
}

struct FlakyDestination {
    healthy: AtomicBool,
    delivered: Mutex<Vec<u64>>,
}

#[async_trait]
impl Destination for FlakyDestination {
    fn name(&self) -> &str {
        "historian"
    }

    async fn write(&self, records: &[Record]) -> Result<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(GatewayError::Connection {
                target: "historian".into(),
                reason: "connection refused".into(),
            });
        }
        self.delivered
            .lock()
            .extend(records.iter().map(|r| r.offset));
        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn codec() -> ReadingCodec {
    ReadingCodec::new(Arc::new(SchemaCache::offline().with_builtins().unwrap()))
}

fn settings() -> GatewaySettings {
    GatewaySettings::new(GATEWAY)
}

fn pipeline(id: &str, image: &str) -> PipelineConfig {
    PipelineConfig::collector(id, id, image)
        .with_rule("pressure", ParameterRule::range(0.0, 500.0))
}

fn config(version: u64, pipelines: Vec<PipelineConfig>) -> GatewayConfig {
    let mut config = GatewayConfig::empty(GATEWAY);
    config.version = version;
    config.pipelines = pipelines;
    config
}

fn reconciler(
    runtime: Arc<FakeRuntime>,
    control_plane: Arc<FakeControlPlane>,
    cache_dir: &Path,
) -> Reconciler {
    let alerts = AlertSink::detached();
    let supervisor = Supervisor::new(runtime, settings(), alerts.clone());
    Reconciler::new(
        supervisor,
        control_plane,
        ConfigCache::new(cache_dir),
        settings(),
        Clock::starting_at(T0),
        alerts,
    )
}

fn governor(log: Arc<MemoryLog>, config: GatewayConfig) -> (OverflowGovernor, AlertSink) {
    let alerts = AlertSink::detached();
    let (_tx, rx) = watch::channel(Arc::new(config));
    let governor = OverflowGovernor::new(log, codec(), alerts.clone(), rx, Clock::starting_at(T0));
    (governor, alerts)
}

fn fill(log: &MemoryLog, topic: &str, records: usize, record_bytes: usize, ts: u64) {
    let key = "k";
    for _ in 0..records {
        log.produce_at(topic, key, vec![0u8; record_bytes - key.len()], ts)
            .unwrap();
    }
}

async fn overflow_events(log: &MemoryLog) -> Vec<OverflowEvent> {
    let codec = codec();
    let mut events = Vec::new();
    for payload in log.payloads(topics::OVERFLOW) {
        events.push(codec.decode(&payload).await.unwrap());
    }
    events
}

// ============================================================================
// Section 1: Config Reconciler
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scenario_a_addition_starts_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let cp = Arc::new(FakeControlPlane::default());
    let mut r = reconciler(runtime.clone(), cp.clone(), dir.path());

    let v1 = config(1, vec![pipeline("press-1", "modbus:1")]);
    assert_eq!(
        r.reconcile(v1).await,
        ReconcileOutcome::Applied { version: 1 }
    );
    let generation = r.supervisor().instance("press-1").unwrap().generation();

    let v2 = config(
        2,
        vec![pipeline("press-1", "modbus:1"), pipeline("temp-1", "opcua:2")],
    );
    assert_eq!(
        r.reconcile(v2).await,
        ReconcileOutcome::Applied { version: 2 }
    );

    assert_eq!(
        runtime.starts(),
        vec!["sf-adapter-press-1".to_string(), "sf-adapter-temp-1".to_string()]
    );
    assert!(runtime.stops().is_empty());
    let press = r.supervisor().instance("press-1").unwrap();
    assert_eq!(press.generation(), generation);
    assert_eq!(press.state(), InstanceState::Running);
    assert_eq!(r.active().unwrap().version, 2);
    assert_eq!(cp.outcomes(), vec!["applied", "applied"]);
}

#[tokio::test(start_paused = true)]
async fn test_stale_versions_are_noops() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let mut r = reconciler(runtime.clone(), Arc::new(FakeControlPlane::default()), dir.path());

    let v3 = config(3, vec![pipeline("press-1", "modbus:1")]);
    r.reconcile(v3.clone()).await;
    assert_eq!(r.reconcile(v3).await, ReconcileOutcome::Unchanged);
    assert_eq!(
        r.reconcile(config(2, vec![])).await,
        ReconcileOutcome::Unchanged
    );
    assert_eq!(runtime.starts().len(), 1);
    assert_eq!(r.supervisor().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let cp = Arc::new(FakeControlPlane::default());
    let mut r = reconciler(runtime.clone(), cp.clone(), dir.path());

    let bad = config(
        1,
        vec![pipeline("press-1", "modbus:1"), pipeline("press-1", "modbus:2")],
    );
    assert!(matches!(
        r.reconcile(bad.clone()).await,
        ReconcileOutcome::Rejected { version: 1, .. }
    ));
    assert!(runtime.starts().is_empty());
    assert!(r.active().is_none());
    // A rejected version is not retried
    assert_eq!(r.reconcile(bad).await, ReconcileOutcome::Unchanged);
    assert_eq!(cp.outcomes(), vec!["rejected"]);
}

#[tokio::test(start_paused = true)]
async fn test_health_regression_rolls_back_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let cp = Arc::new(FakeControlPlane::default());
    let mut r = reconciler(runtime.clone(), cp.clone(), dir.path());

    let v1 = config(
        1,
        vec![pipeline("press-1", "modbus:1"), pipeline("temp-1", "opcua:2")],
    );
    r.reconcile(v1.clone()).await;
    let before = serde_json::to_vec(&*r.active().unwrap()).unwrap();

    let v2 = config(
        2,
        vec![pipeline("press-1", "modbus:1-crash"), pipeline("temp-1", "opcua:2")],
    );
    let outcome = r.reconcile(v2).await;
    assert!(matches!(outcome, ReconcileOutcome::RolledBack { version: 2, .. }));

    let after = serde_json::to_vec(&*r.active().unwrap()).unwrap();
    assert_eq!(before, after);
    assert_eq!(r.supervisor().pipelines(), v1.pipelines);
    assert_eq!(
        ConfigCache::new(dir.path()).load().unwrap().unwrap(),
        v1
    );
    assert_eq!(cp.outcomes(), vec!["applied", "rolled_back"]);
    // The untouched pipeline was never restarted
    assert_eq!(
        runtime
            .starts()
            .iter()
            .filter(|n| n.as_str() == "sf-adapter-temp-1")
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_apply_error_reverts_every_step() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let mut r = reconciler(runtime.clone(), Arc::new(FakeControlPlane::default()), dir.path());

    let v1 = config(
        1,
        vec![pipeline("press-1", "modbus:1"), pipeline("temp-1", "opcua:2")],
    );
    r.reconcile(v1.clone()).await;

    // Removal of temp-1 succeeds, the addition fails to start
    let v2 = config(
        2,
        vec![pipeline("press-1", "modbus:1"), pipeline("flow-1", "broken:1")],
    );
    assert!(matches!(
        r.reconcile(v2).await,
        ReconcileOutcome::RolledBack { version: 2, .. }
    ));
    assert_eq!(r.supervisor().pipelines(), v1.pipelines);
    assert_eq!(r.active().unwrap().version, 1);
    assert_eq!(
        runtime.running(),
        vec!["sf-adapter-press-1".to_string(), "sf-adapter-temp-1".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_requires_control_plane_or_cache() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());

    let mut r = reconciler(runtime.clone(), Arc::new(FakeControlPlane::down()), dir.path());
    assert!(matches!(
        r.bootstrap().await,
        Err(GatewayError::ControlPlaneUnreachable(_))
    ));

    ConfigCache::new(dir.path())
        .store(&config(4, vec![pipeline("press-1", "modbus:1")]))
        .unwrap();
    let mut r = reconciler(runtime.clone(), Arc::new(FakeControlPlane::down()), dir.path());
    assert_eq!(r.bootstrap().await.unwrap(), Some(4));

    let newer = Arc::new(FakeControlPlane::serving(config(5, vec![])));
    let mut r = reconciler(runtime, newer, dir.path());
    assert_eq!(r.bootstrap().await.unwrap(), Some(5));
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_cache_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ConfigCache::new(dir.path());
    cache.store(&config(1, vec![])).unwrap();
    let mut bytes = std::fs::read(cache.path()).unwrap();
    let last = bytes.len() - 2;
    bytes[last] ^= 0xff;
    std::fs::write(cache.path(), bytes).unwrap();

    let mut r = reconciler(
        Arc::new(FakeRuntime::default()),
        Arc::new(FakeControlPlane::down()),
        dir.path(),
    );
    let err = r.bootstrap().await.unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn test_pull_is_none_when_offline() {
    let dir = tempfile::tempdir().unwrap();
    let mut r = reconciler(
        Arc::new(FakeRuntime::default()),
        Arc::new(FakeControlPlane::down()),
        dir.path(),
    );
    assert!(r.pull().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_outage_alerts_once() {
    let dir = tempfile::tempdir().unwrap();
    let cp = Arc::new(FakeControlPlane::down());
    let alerts = AlertSink::detached();
    let supervisor = Supervisor::new(Arc::new(FakeRuntime::default()), settings(), alerts.clone());
    let mut r = Reconciler::new(
        supervisor,
        cp.clone(),
        ConfigCache::new(dir.path()),
        settings(),
        Clock::starting_at(T0),
        alerts.clone(),
    );

    for _ in 0..3 {
        assert!(r.pull().await.is_none());
    }
    let raised = alerts.recent();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, AlertSeverity::Warning);
    assert!(raised[0].message.contains("unreachable"));

    // Recovery ends the outage; the next one alerts again
    cp.unreachable.store(false, Ordering::SeqCst);
    *cp.config.lock() = Some(config(1, vec![]));
    assert_eq!(r.pull().await.map(|c| c.version), Some(1));
    cp.unreachable.store(true, Ordering::SeqCst);
    assert!(r.pull().await.is_none());
    assert!(r.pull().await.is_none());
    assert_eq!(alerts.recent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_config_reported_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cp = Arc::new(FakeControlPlane::default());
    cp.garbled.store(true, Ordering::SeqCst);
    let alerts = AlertSink::detached();
    let supervisor = Supervisor::new(Arc::new(FakeRuntime::default()), settings(), alerts.clone());
    let mut r = Reconciler::new(
        supervisor,
        cp.clone(),
        ConfigCache::new(dir.path()),
        settings(),
        Clock::starting_at(T0),
        alerts.clone(),
    );

    assert!(r.pull().await.is_none());
    assert!(r.pull().await.is_none());
    assert_eq!(cp.outcomes(), vec!["rejected".to_string()]);
    assert!(cp.reports.lock()[0]
        .reconciliation
        .as_ref()
        .unwrap()
        .detail
        .contains("invalid JSON"));
    assert_eq!(alerts.recent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejections_pruned_once_superseded() {
    let dir = tempfile::tempdir().unwrap();
    let mut r = reconciler(
        Arc::new(FakeRuntime::default()),
        Arc::new(FakeControlPlane::default()),
        dir.path(),
    );

    let mut foreign = config(2, vec![]);
    foreign.gateway_id = "plant-9".into();
    assert!(matches!(
        r.reconcile(foreign.clone()).await,
        ReconcileOutcome::Rejected { version: 2, .. }
    ));
    foreign.version = 5;
    r.reconcile(foreign).await;
    assert_eq!(r.rejected_versions(), vec![2, 5]);

    assert_eq!(
        r.reconcile(config(3, vec![])).await,
        ReconcileOutcome::Applied { version: 3 }
    );
    assert_eq!(r.rejected_versions(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_instance_revived_by_next_version() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::default());
    let mut r = reconciler(runtime.clone(), Arc::new(FakeControlPlane::default()), dir.path());

    let v1 = config(1, vec![pipeline("press-1", "modbus:1")]);
    r.reconcile(v1.clone()).await;

    runtime.sabotage("sf-adapter-press-1");
    for i in 0..6 {
        r.supervisor_mut().sweep(T0 + i * 1_000).await;
    }
    assert_eq!(r.supervisor().state("press-1"), Some(InstanceState::Failed));

    // Same pipelines, new version: the FAILED instance gets a fresh start
    runtime.heal("sf-adapter-press-1");
    let mut v2 = v1.clone();
    v2.version = 2;
    assert_eq!(
        r.reconcile(v2).await,
        ReconcileOutcome::Applied { version: 2 }
    );
    let instance = r.supervisor().instance("press-1").unwrap();
    assert_eq!(instance.state(), InstanceState::Running);
    assert_eq!(instance.generation(), 0);
}

// ============================================================================
// Section 2: Component Supervisor
// ============================================================================

fn supervisor(runtime: Arc<FakeRuntime>) -> (Supervisor, AlertSink) {
    let alerts = AlertSink::detached();
    (Supervisor::new(runtime, settings(), alerts.clone()), alerts)
}

#[tokio::test(start_paused = true)]
async fn test_restart_budget_caps_at_five() {
    let runtime = Arc::new(FakeRuntime::default());
    let (mut sup, alerts) = supervisor(runtime.clone());
    let mut critical = pipeline("press-1", "modbus:crash");
    critical.critical = true;
    sup.start(&critical, T0).await.unwrap();
    let table = sup.subscribe();

    for i in 0..10u64 {
        sup.sweep(T0 + i * 5_000).await;
        let snapshot = table.borrow()["press-1"].clone();
        assert!(snapshot.restarts_in_window <= 5);
    }

    assert_eq!(sup.state("press-1"), Some(InstanceState::Failed));
    assert_eq!(runtime.starts().len(), 6);
    let alert = alerts.recent().pop().unwrap();
    assert_eq!(alert.severity, AlertSeverity::Critical);
    assert!(alert.message.contains("FAILED"));
}

#[tokio::test(start_paused = true)]
async fn test_restart_budget_is_a_rolling_window() {
    let runtime = Arc::new(FakeRuntime::default());
    let (mut sup, _) = supervisor(runtime.clone());
    sup.start(&pipeline("press-1", "modbus:crash"), T0).await.unwrap();

    // One crash a minute: five restarts fill the window
    for i in 0..5u64 {
        sup.sweep(T0 + i * 60_000).await;
    }
    assert_eq!(sup.state("press-1"), Some(InstanceState::Starting));

    // The first restart has aged out, so one more is allowed
    sup.sweep(T0 + 300_000).await;
    assert_eq!(sup.state("press-1"), Some(InstanceState::Starting));
    assert_eq!(sup.instance("press-1").unwrap().generation(), 6);

    // Five restarts inside the last five minutes again
    sup.sweep(T0 + 300_001).await;
    assert_eq!(sup.state("press-1"), Some(InstanceState::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_hung_component_is_timed_out() {
    let runtime = Arc::new(FakeRuntime::default());
    let (mut sup, _) = supervisor(runtime.clone());
    sup.start(&pipeline("press-1", "modbus:hang"), T0).await.unwrap();

    sup.sweep(T0).await;
    sup.sweep(T0 + 5_000).await;
    assert_eq!(sup.instance("press-1").unwrap().generation(), 0);
    sup.sweep(T0 + 10_000).await;

    let instance = sup.instance("press-1").unwrap();
    assert_eq!(instance.generation(), 1);
    assert_eq!(instance.state(), InstanceState::Starting);
    assert_eq!(runtime.stops(), vec!["sf-adapter-press-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_memory_ceiling_kills_and_restarts() {
    let runtime = Arc::new(FakeRuntime::default());
    let (mut sup, _) = supervisor(runtime.clone());
    let table = sup.subscribe();
    sup.start(&pipeline("press-1", "modbus:oom"), T0).await.unwrap();
    sup.sweep(T0).await;

    let snapshot = table.borrow()["press-1"].clone();
    assert_eq!(snapshot.state, InstanceState::Starting);
    assert!(snapshot.last_error.unwrap().contains("ceiling"));
    assert_eq!(runtime.stops().len(), 1);
    assert_eq!(runtime.starts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_reports_degraded() {
    let runtime = Arc::new(FakeRuntime::default());
    let (mut sup, _) = supervisor(runtime);
    sup.start(&pipeline("exp-1", "historian:open-circuit"), T0)
        .await
        .unwrap();
    sup.start(&pipeline("press-1", "modbus:1"), T0).await.unwrap();
    sup.sweep(T0).await;

    assert_eq!(sup.state("exp-1"), Some(InstanceState::Degraded));
    assert_eq!(sup.state("press-1"), Some(InstanceState::Running));
    let table = sup.subscribe().borrow().clone();
    let rollup = compose(GATEWAY, 1, &table, &[], GovernorStatus::default(), T0);
    assert_eq!(rollup.status, HealthStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_stops_everything() {
    let runtime = Arc::new(FakeRuntime::default());
    let (mut sup, _) = supervisor(runtime.clone());
    sup.start(&pipeline("press-1", "modbus:1"), T0).await.unwrap();
    sup.start(&pipeline("temp-1", "opcua:1"), T0).await.unwrap();
    sup.stop_all(T0).await;
    assert!(sup.is_empty());
    assert!(runtime.running().is_empty());
}

// ============================================================================
// Section 3: Overflow Governor
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_tiers_monotonic_with_rising_usage() {
    let log = Arc::new(MemoryLog::new(1_000));
    let (mut gov, alerts) = governor(log.clone(), config(1, vec![]));

    let mut last = 0;
    for used in [100, 500, 700, 720, 810, 850, 905, 930, 960, 990] {
        log.set_external_usage(used);
        let status = gov.poll().await.unwrap();
        assert!(status.tier >= last, "tier dropped at {} bytes", used);
        last = status.tier;
    }
    assert_eq!(last, 5);

    let severities: Vec<_> = alerts.recent().iter().map(|a| a.severity).collect();
    assert_eq!(
        severities,
        vec![
            AlertSeverity::Advisory,
            AlertSeverity::Warning,
            AlertSeverity::Critical,
            AlertSeverity::Page
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_block_and_unblock_are_audited() {
    let log = Arc::new(MemoryLog::new(1_000_000));
    let (mut gov, _) = governor(log.clone(), config(1, vec![]));

    log.set_external_usage(960_000);
    let status = gov.poll().await.unwrap();
    assert!(status.blocked);
    assert!(matches!(log.admission(), Admission::Blocked { .. }));
    assert!(log
        .produce(topics::CLEAN, "press-1", vec![1, 2, 3])
        .await
        .is_err());

    log.set_external_usage(500_000);
    let status = gov.poll().await.unwrap();
    assert!(!status.blocked);
    assert_eq!(status.tier, 1);
    assert_eq!(log.admission(), Admission::Open);

    let actions: Vec<_> = overflow_events(&log)
        .await
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec![OverflowAction::Block, OverflowAction::Unblock]);
}

#[tokio::test(start_paused = true)]
async fn test_block_holds_while_evicting() {
    let log = Arc::new(MemoryLog::new(100_000));
    let cfg = config(1, vec![pipeline("press-1", "modbus:1")]);
    let recent = T0 - 1_000;

    // 96% with plenty of evictable data
    fill(&log, "raw.press-1", 10, 1_000, recent);
    fill(&log, topics::CLEAN, 40, 1_000, recent);
    fill(&log, topics::DEAD_LETTER, 30, 1_000, recent);
    fill(&log, topics::ALARMS, 16, 1_000, recent);
    let (mut gov, alerts) = governor(log.clone(), cfg);

    let status = gov.poll().await.unwrap();
    assert_eq!(status.tier, 5);
    assert!(status.blocked);
    assert!(status.usage_pct < 90.0);
    assert!(matches!(log.admission(), Admission::Blocked { .. }));
    assert!(log
        .produce(topics::CLEAN, "press-1", vec![1, 2, 3])
        .await
        .is_err());
    assert_eq!(alerts.recent()[0].severity, AlertSeverity::Page);

    let actions: Vec<_> = overflow_events(&log)
        .await
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions, vec![OverflowAction::Block, OverflowAction::Evict]);
    assert_eq!(log.len(topics::DEAD_LETTER), 30);
    assert_eq!(log.len(topics::ALARMS), 16);

    // Eviction brought usage down: the next poll reopens the log
    let status = gov.poll().await.unwrap();
    assert!(!status.blocked);
    assert!(status.tier < 5);
    assert_eq!(log.admission(), Admission::Open);
    let actions: Vec<_> = overflow_events(&log)
        .await
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            OverflowAction::Block,
            OverflowAction::Evict,
            OverflowAction::Unblock
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_eviction_by_priority() {
    let log = Arc::new(MemoryLog::new(10_000));
    let cfg = config(1, vec![pipeline("press-1", "modbus:1")]);
    assert_eq!(cfg.priority_of("raw.press-1"), TopicPriority::Low);
    let recent = T0 - 1_000;

    fill(&log, "raw.press-1", 2, 100, recent);
    fill(&log, topics::CLEAN, 50, 100, recent);
    fill(&log, &topics::rollup("1m"), 10, 100, recent);
    fill(&log, topics::DEAD_LETTER, 20, 100, recent);
    fill(&log, topics::ALARMS, 9, 100, recent);
    log.set_external_usage(250);
    let (mut gov, _) = governor(log.clone(), cfg);

    let status = gov.poll().await.unwrap();
    assert_eq!(status.tier, 4);

    let events = overflow_events(&log).await;
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.action, OverflowAction::Evict);
    assert_eq!(
        event.affected_topics,
        vec!["raw.press-1".to_string(), topics::CLEAN.to_string()]
    );
    assert!(event.usage_before_pct > 93.0);
    assert!(event.usage_after_pct < 90.0);
    assert_eq!(log.len("raw.press-1"), 0);
    assert_eq!(log.len(topics::CLEAN), 48);
    assert_eq!(log.len(topics::DEAD_LETTER), 20);
    assert_eq!(log.len(topics::ALARMS), 9);
    assert_eq!(log.len(&topics::rollup("1m")), 10);
}

#[tokio::test(start_paused = true)]
async fn test_critical_topics_never_evicted() {
    let log = Arc::new(MemoryLog::new(10_000));
    let mut cfg = config(1, vec![]);
    cfg.settings
        .topic_priorities
        .insert("plc.audit".into(), TopicPriority::Critical);
    let recent = T0 - 1_000;

    // Only critical data: nothing may go, whatever the pressure
    fill(&log, topics::DEAD_LETTER, 60, 100, recent);
    fill(&log, topics::ALARMS, 20, 100, recent);
    fill(&log, "plc.audit", 16, 100, recent);
    let (mut gov, _) = governor(log.clone(), cfg);

    let status = gov.poll().await.unwrap();
    assert_eq!(status.tier, 5);
    assert_eq!(log.len(topics::DEAD_LETTER), 60);
    assert_eq!(log.len(topics::ALARMS), 20);
    assert_eq!(log.len("plc.audit"), 16);
    for event in overflow_events(&log).await {
        assert!(event
            .affected_topics
            .iter()
            .all(|t| t != topics::DEAD_LETTER && t != topics::ALARMS && t != "plc.audit"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_purge_raw_keeps_aggregates() {
    let log = Arc::new(MemoryLog::new(10_000));
    let mut cfg = config(1, vec![pipeline("press-1", "modbus:1")]);
    cfg.settings.storage.compress_after_ms = 4 * 3_600_000;
    let old = T0 - 2 * 3_600_000;

    fill(&log, "raw.press-1", 30, 100, old);
    fill(&log, topics::CLEAN, 25, 100, old);
    fill(&log, &topics::rollup("15m"), 30, 100, old);
    let (mut gov, _) = governor(log.clone(), cfg);

    // 85%: nothing is old enough to compress, raw resolution past retention goes
    let status = gov.poll().await.unwrap();
    assert_eq!(status.tier, 3);
    assert_eq!(log.len("raw.press-1"), 0);
    assert_eq!(log.len(topics::CLEAN), 0);
    assert_eq!(log.len(&topics::rollup("15m")), 30);

    let events = overflow_events(&log).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, OverflowAction::PurgeRaw);
    assert_eq!(
        events[0].affected_topics,
        vec!["raw.press-1".to_string(), topics::CLEAN.to_string()]
    );
}

// ============================================================================
// Section 4: Export
// ============================================================================

#[tokio::test]
async fn test_scenario_d_open_circuit_keeps_data_in_log() {
    let log = Arc::new(MemoryLog::new(1 << 20));
    let codec = codec();
    let reading = Reading::new("press-1", "pressure", 250.0, T0);
    let payload = codec.encode(READING_SUBJECT, &reading).await.unwrap();
    log.produce_at(topics::CLEAN, "press-1", payload, T0).unwrap();

    let destination = Arc::new(FlakyDestination {
        healthy: AtomicBool::new(false),
        delivered: Mutex::new(Vec::new()),
    });
    let mut pump = ExportPump::new(
        log.clone(),
        topics::CLEAN,
        destination.clone(),
        Default::default(),
    );

    for _ in 0..5 {
        assert!(matches!(
            pump.pump_once(T0).await.unwrap(),
            PumpOutcome::Failed { .. }
        ));
    }
    assert_eq!(pump.circuit().state, CircuitState::Open);
    assert!(matches!(
        pump.pump_once(T0 + 1).await.unwrap(),
        PumpOutcome::Skipped { .. }
    ));
    assert_eq!(log.committed(topics::CLEAN, pump.group()).await.unwrap(), None);
    assert_eq!(log.fetch(topics::CLEAN, 0, 10).await.unwrap().len(), 1);

    // After the cool-down one probe goes through and closes the circuit
    destination.healthy.store(true, Ordering::SeqCst);
    assert_eq!(
        pump.pump_once(T0 + 30_000).await.unwrap(),
        PumpOutcome::Written {
            records: 1,
            next_offset: 1
        }
    );
    assert_eq!(pump.circuit().state, CircuitState::Closed);
    assert_eq!(pump.circuit().consecutive_failures, 0);
    assert_eq!(*destination.delivered.lock(), vec![0]);
}

#[tokio::test]
async fn test_undecodable_record_does_not_trip_the_circuit() {
    let log = Arc::new(MemoryLog::new(1 << 20));
    let codec = codec();
    log.produce_at(topics::CLEAN, "press-1", vec![7, 7, 7], T0).unwrap();
    let reading = Reading::new("press-1", "pressure", 250.0, T0);
    let payload = codec.encode(READING_SUBJECT, &reading).await.unwrap();
    log.produce_at(topics::CLEAN, "press-1", payload, T0).unwrap();

    let destination = Arc::new(FlakyDestination {
        healthy: AtomicBool::new(true),
        delivered: Mutex::new(Vec::new()),
    });
    let alerts = AlertSink::detached();
    let mut pump = ExportPump::new(
        log.clone(),
        topics::CLEAN,
        destination.clone(),
        Default::default(),
    )
    .with_alerts(alerts.clone());

    assert_eq!(
        pump.pump_once(T0).await.unwrap(),
        PumpOutcome::Written {
            records: 1,
            next_offset: 2
        }
    );
    for i in 1..8 {
        assert_eq!(pump.pump_once(T0 + i).await.unwrap(), PumpOutcome::Idle);
    }

    assert_eq!(*destination.delivered.lock(), vec![1]);
    assert_eq!(pump.circuit().state, CircuitState::Closed);
    assert_eq!(pump.stats().dropped, 1);
    assert_eq!(log.committed(topics::CLEAN, pump.group()).await.unwrap(), Some(2));
    let raised = alerts.recent();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].severity, AlertSeverity::Warning);
    assert!(raised[0].message.contains("undecodable"));
}

#[tokio::test]
async fn test_undecodable_records_alert_once_while_circuit_open() {
    let log = Arc::new(MemoryLog::new(1 << 20));
    let codec = codec();
    log.produce_at(topics::CLEAN, "press-1", vec![7, 7, 7], T0).unwrap();
    let reading = Reading::new("press-1", "pressure", 250.0, T0);
    let payload = codec.encode(READING_SUBJECT, &reading).await.unwrap();
    log.produce_at(topics::CLEAN, "press-1", payload, T0).unwrap();

    let destination = Arc::new(FlakyDestination {
        healthy: AtomicBool::new(false),
        delivered: Mutex::new(Vec::new()),
    });
    let alerts = AlertSink::detached();
    let mut pump = ExportPump::new(log.clone(), topics::CLEAN, destination, Default::default())
        .with_alerts(alerts.clone());
    for _ in 0..8 {
        pump.pump_once(T0).await.unwrap();
    }

    // Transport failures open the circuit; the bad frame is reported once
    assert_eq!(pump.circuit().state, CircuitState::Open);
    assert_eq!(alerts.recent().len(), 1);
    assert_eq!(log.committed(topics::CLEAN, pump.group()).await.unwrap(), None);
}

// ============================================================================
// Section 5: Health Reporter
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reporter_publishes_to_log_and_upstream() {
    let log = Arc::new(MemoryLog::new(1 << 20));
    let cp = Arc::new(FakeControlPlane::default());
    let (_table_tx, table_rx) = watch::channel(Arc::new(InstanceTable::new()));
    let (_gov_tx, gov_rx) = watch::channel(GovernorStatus {
        tier: 4,
        usage_pct: 92.0,
        blocked: false,
    });
    let (_cfg_tx, cfg_rx) = watch::channel(Arc::new(config(7, vec![])));

    let mut reporter = HealthReporter::new(
        GATEWAY,
        table_rx,
        gov_rx,
        cfg_rx,
        log.clone(),
        codec(),
        Some(cp.clone() as Arc<dyn ControlPlane>),
        Clock::starting_at(T0),
    );
    let rollup = reporter.publish().await;

    assert_eq!(rollup.status, HealthStatus::Unhealthy);
    assert_eq!(rollup.config_version, 7);
    assert_eq!(log.len(topics::HEALTH), 1);
    let reports = cp.reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].health.as_ref().unwrap().overflow_tier, 4);
    assert_eq!(reporter.subscribe().borrow().status, HealthStatus::Unhealthy);
}

// ============================================================================
// Section 6: Assembled Gateway
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_gateway_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(MemoryLog::new(1 << 26));
    let codec = codec();
    let runtime = Arc::new(FakeRuntime::default());
    let cp = Arc::new(FakeControlPlane::serving(config(
        1,
        vec![pipeline("press-1", "modbus:1")],
    )));

    let gateway = Gateway::new(
        settings(),
        log.clone(),
        codec.clone(),
        runtime.clone(),
        cp.clone(),
        ConfigCache::new(dir.path()),
    )
    .with_clock(Clock::starting_at(T0));
    let handle = gateway.start().await.unwrap();
    let view = handle.view();

    // Collector output lands in the raw stream while the health window runs
    for (i, value) in [250.0, 900.0, 255.0].into_iter().enumerate() {
        let reading = Reading::new("press-1", "pressure", value, T0 + i as u64 * 1_000)
            .with_device_time_ms((T0 + i as u64 * 1_000) as i64);
        let payload = codec.encode(READING_SUBJECT, &reading).await.unwrap();
        log.produce_at("raw.press-1", "press-1", payload, T0).unwrap();
    }

    tokio::time::sleep(Duration::from_secs(75)).await;

    assert_eq!(view.config().version, 1);
    assert_eq!(
        view.instances()["press-1"].state,
        InstanceState::Running
    );
    assert_eq!(log.len(topics::CLEAN), 2);
    assert_eq!(log.len(topics::DEAD_LETTER), 1);
    assert_eq!(view.stats().validators["raw.press-1"].range_violations, 1);
    assert_eq!(view.health().status, HealthStatus::Healthy);
    assert_eq!(
        ConfigCache::new(dir.path()).load().unwrap().unwrap().version,
        1
    );

    handle.shutdown().await;
    assert!(runtime.running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_gateway_surfaces_export_circuit() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(MemoryLog::new(1 << 26));
    let codec = codec();
    let cp = Arc::new(FakeControlPlane::serving(config(
        1,
        vec![pipeline("press-1", "modbus:1")],
    )));
    let destination = Arc::new(FlakyDestination {
        healthy: AtomicBool::new(false),
        delivered: Mutex::new(Vec::new()),
    });

    let gateway = Gateway::new(
        settings(),
        log.clone(),
        codec.clone(),
        Arc::new(FakeRuntime::default()),
        cp,
        ConfigCache::new(dir.path()),
    )
    .with_clock(Clock::starting_at(T0))
    .with_export(topics::CLEAN, destination);
    let handle = gateway.start().await.unwrap();
    let view = handle.view();

    let reading = Reading::new("press-1", "pressure", 250.0, T0).with_device_time_ms(T0 as i64);
    let payload = codec.encode(READING_SUBJECT, &reading).await.unwrap();
    log.produce_at("raw.press-1", "press-1", payload, T0).unwrap();

    tokio::time::sleep(Duration::from_secs(75)).await;

    let exports = view.exports();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].destination, "historian");
    assert_eq!(exports[0].circuit.state, CircuitState::Open);
    assert!(exports[0].stats.failed_writes >= 5);

    // Export trouble degrades the gateway without making it unhealthy
    let health = view.health();
    assert_eq!(health.status, HealthStatus::Degraded);
    let check = health
        .components
        .iter()
        .find(|c| c.component == "export.historian")
        .unwrap();
    assert_eq!(check.status, HealthStatus::Degraded);
    assert!(!check.critical);
    assert_eq!(log.committed(topics::CLEAN, "export.historian").await.unwrap(), None);

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_gateway_cold_start_fails_offline() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Gateway::new(
        settings(),
        Arc::new(MemoryLog::new(1 << 20)),
        codec(),
        Arc::new(FakeRuntime::default()),
        Arc::new(FakeControlPlane::down()),
        ConfigCache::new(dir.path()),
    );
    assert!(matches!(
        gateway.start().await,
        Err(GatewayError::ControlPlaneUnreachable(_))
    ));
}

#[test]
fn test_overflow_subject_is_builtin() {
    let cache = SchemaCache::offline().with_builtins().unwrap();
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    assert!(rt.block_on(cache.resolve_latest(OVERFLOW_SUBJECT)).is_ok());
}
