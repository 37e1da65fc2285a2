//! # Edgeloop - Edge gateway control loop
//!
//! Core types for an industrial edge gateway that keeps a set of data
//! collector and exporter components running, validates and aggregates
//! their readings, protects local storage from overflow and reports its
//! health upstream.
//!
//! ## Key Features
//!
//! - **Versioned configuration**: validated, diffed, cached with a checksum
//! - **Quality codes**: GOOD / SUSPECT / UNCERTAIN / BAD on immutable readings
//! - **Circuit breaking**: every external connection, single half-open probe
//! - **Health roll-up**: component checks plus overflow tier into one status
//! - **Durable log port**: narrow async interface over the external log
//!
//! ## Quick Start
//!
//! ```rust
//! use edgeloop::{CircuitBreaker, CircuitState, Reading, QualityCode};
//!
//! let reading = Reading::new("press-1", "temperature", 21.5, 1_700_000_000_000)
//!     .with_unit("C");
//! let clean = reading.classified(QualityCode::Good);
//! assert_eq!(clean.quality, Some(QualityCode::Good));
//!
//! let mut breaker = CircuitBreaker::new();
//! for t in 0..5 {
//!     breaker.record_failure(t);
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Gateway and pipeline configuration, diffing, local cache
//! - [`reading`]: Readings, quality codes, dead-letter entries
//! - [`window`]: Resolutions and aggregate windows
//! - [`recovery`]: Circuit breaker
//! - [`health`]: Component checks and gateway roll-up
//! - [`log`]: Durable log port and in-process log
//! - [`schema`]: Schema cache and payload framing
//! - [`events`]: Overflow audit events and alerts
//! - [`topics`]: Topic catalogue and priorities

// Modules
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod log;
pub mod reading;
pub mod recovery;
pub mod schema;
pub mod topics;
pub mod window;

// Re-exports for convenient access
pub use config::{
    ComponentKind, ConfigCache, ConfigDiff, GatewayConfig, GlobalSettings, LatePolicy,
    ParameterRule, PipelineConfig, ResourceLimits, StorageSettings, ValidationRules,
};
pub use error::{AlertSeverity, GatewayError, Result};
pub use events::{Alert, OverflowAction, OverflowEvent};
pub use health::{roll_up, HealthCheck, HealthRollup, HealthStatus};
pub use log::{Admission, DurableLog, EvictionOutcome, MemoryLog, Record, StorageUsage, TopicInfo};
pub use reading::{
    Classification, DeadLetterDecision, DeadLetterEntry, FailureReason, QualityCode, Reading,
    ReadingKey, SeriesKey,
};
pub use recovery::{CircuitBreaker, CircuitConfig, CircuitState, CircuitStatus};
pub use schema::{ReadingCodec, Schema, SchemaCache, SchemaRegistry};
pub use topics::TopicPriority;
pub use window::{AggregateWindow, QualityCounts, Resolution, Summary};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
