// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Edgeloop Gateway - Control loop orchestration
//!
//! This crate runs the gateway control loop on top of the `edgeloop` data
//! model and the `edgeloop-quality` state machines.
//!
//! ## Units
//!
//! - **Config Reconciler**: pulls and caches the config, diffs it against
//!   running components, applies it all-or-nothing and rolls back on a health
//!   regression
//! - **Component Supervisor**: starts, probes, restarts and stops collector
//!   and exporter components under a restart budget and resource ceilings
//! - **Overflow Governor**: runs the storage tier ladder over the durable log
//! - **Health Reporter**: rolls component health and the overflow tier into
//!   one gateway status
//! - **Stream workers**: validation, aggregation and dead-letter re-ingest
//! - **Export pump**: circuit-guarded delivery of a topic to a destination
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edgeloop::{ConfigCache, MemoryLog, ReadingCodec, SchemaCache};
//! use edgeloop_gateway::{
//!     DockerCliRuntime, DockerConfig, FileConfigSource, Gateway, GatewaySettings,
//! };
//!
//! # async fn run() -> edgeloop::Result<()> {
//! let codec = ReadingCodec::new(Arc::new(SchemaCache::offline().with_builtins()?));
//! let gateway = Gateway::new(
//!     GatewaySettings::new("plant-7"),
//!     Arc::new(MemoryLog::new(8 << 30)),
//!     codec,
//!     Arc::new(DockerCliRuntime::new(DockerConfig::default())?),
//!     Arc::new(FileConfigSource::new("/etc/edgeloop/gateway.json")),
//!     ConfigCache::new("/var/lib/edgeloop"),
//! );
//!
//! let handle = gateway.start().await?;
//! println!("{}", handle.view().health().report());
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Every unit is its own tokio task. The supervisor is the sole writer of
//! component state; everything else reads `watch` snapshots. Runtime calls
//! and probes are bounded by timeouts so a hung component never blocks the
//! loop.

mod alerts;
mod clock;
mod control_plane;
mod export;
mod gateway;
mod health_reporter;
mod overflow;
mod reconciler;
mod registry;
mod runtime;
mod settings;
mod supervisor;
mod workers;

pub use alerts::AlertSink;
pub use clock::Clock;
pub use control_plane::{
    ControlPlane, FileConfigSource, GuardedControlPlane, HttpControlPlane, ReconcileReport,
    StatusReport,
};
pub use export::{
    exportable, Destination, ExportPump, HttpDestination, PumpOutcome, PumpStats, PumpStatus,
};
pub use gateway::{ConfigNotifier, Gateway, GatewayHandle, GatewayView};
pub use health_reporter::{check_for, check_for_export, compose, HealthReporter};
pub use overflow::{GovernorStatus, OverflowGovernor, OverflowTier};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use registry::HttpSchemaRegistry;
pub use runtime::{
    ComponentProbe, ContainerRuntime, ContainerSpec, DockerCliRuntime, DockerConfig,
    InstanceHandle, Readiness, RuntimeState, APP_LABEL, CONTAINER_PREFIX,
};
pub use settings::GatewaySettings;
pub use supervisor::{
    ComponentInstance, InstanceSnapshot, InstanceState, InstanceTable, RestartBudget, Supervisor,
};
pub use workers::{
    aggregator_config, rules_for_stream, AggregatorWorker, DecisionWorker, PipelineStats,
    SharedStats, ValidatorWorker, AGGREGATOR_GROUP, DECISION_GROUP, VALIDATOR_GROUP,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
