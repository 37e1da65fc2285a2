// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for the gateway control loop
//!
//! Every variant is locally recoverable except [`GatewayError::Invariant`],
//! which signals corrupted local state and restarts the whole process under
//! external supervision.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed or incompatible configuration; previous config stays active
    #[error("Config error: {0}")]
    Config(String),

    /// A supervised component exited
    #[error("Component {instance} crashed: {reason}")]
    ComponentCrash { instance: String, reason: String },

    /// A supervised component stopped answering health checks
    #[error("Component {instance} did not answer health check within {timeout_ms}ms")]
    ComponentTimeout { instance: String, timeout_ms: u64 },

    /// External I/O failure of a collector/exporter/control-plane connection
    #[error("Connection failure to {target}: {reason}")]
    Connection { target: String, reason: String },

    /// Call rejected because the circuit is open
    #[error("Circuit open for {target}, retry after {retry_after_ms}ms")]
    CircuitOpen { target: String, retry_after_ms: u64 },

    /// Local storage pressure blocked the operation
    #[error("Storage exhausted: {0}")]
    StorageExhaustion(String),

    /// Control plane could not be reached; cached config stays authoritative
    #[error("Control plane unreachable: {0}")]
    ControlPlaneUnreachable(String),

    /// Schema could not be resolved from registry or cache
    #[error("Schema error: {0}")]
    Schema(String),

    /// Durable log rejected or failed an operation
    #[error("Log error: {0}")]
    Log(String),

    /// Container runtime failure while starting or stopping
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Unrecoverable internal invariant violation (e.g. corrupted local state)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Alert severity attached to every error class and governor tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Advisory,
    Warning,
    Critical,
    Page,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Advisory => "advisory",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
            AlertSeverity::Page => "page",
        }
    }
}

impl GatewayError {
    /// Only an invariant violation is allowed to take the process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Invariant(_))
    }

    /// Severity of the alert raised when this error is observed
    pub fn severity(&self) -> AlertSeverity {
        match self {
            GatewayError::Connection { .. }
            | GatewayError::CircuitOpen { .. }
            | GatewayError::ControlPlaneUnreachable(_)
            | GatewayError::Schema(_) => AlertSeverity::Advisory,
            GatewayError::Config(_)
            | GatewayError::ComponentCrash { .. }
            | GatewayError::ComponentTimeout { .. }
            | GatewayError::Runtime(_)
            | GatewayError::Log(_)
            | GatewayError::Io(_)
            | GatewayError::Json(_) => AlertSeverity::Warning,
            GatewayError::StorageExhaustion(_) => AlertSeverity::Critical,
            GatewayError::Invariant(_) => AlertSeverity::Page,
        }
    }

    /// Short machine-readable class name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "config",
            GatewayError::ComponentCrash { .. } => "component_crash",
            GatewayError::ComponentTimeout { .. } => "component_timeout",
            GatewayError::Connection { .. } => "connection",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::StorageExhaustion(_) => "storage_exhaustion",
            GatewayError::ControlPlaneUnreachable(_) => "control_plane_unreachable",
            GatewayError::Schema(_) => "schema",
            GatewayError::Log(_) => "log",
            GatewayError::Runtime(_) => "runtime",
            GatewayError::Invariant(_) => "invariant",
            GatewayError::Io(_) => "io",
            GatewayError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::ComponentTimeout {
            instance: "sf-adapter-press-1".to_string(),
            timeout_ms: 5000,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("sf-adapter-press-1"));
        assert!(msg.contains("5000"));
    }

    #[test]
    fn test_only_invariant_is_fatal() {
        assert!(GatewayError::Invariant("cache checksum".into()).is_fatal());
        assert!(!GatewayError::Config("bad".into()).is_fatal());
        assert!(!GatewayError::StorageExhaustion("full".into()).is_fatal());
        assert!(!GatewayError::ControlPlaneUnreachable("dns".into()).is_fatal());
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            GatewayError::StorageExhaustion("x".into()).severity(),
            AlertSeverity::Critical
        );
        assert_eq!(
            GatewayError::Invariant("x".into()).severity(),
            AlertSeverity::Page
        );
        assert!(AlertSeverity::Advisory < AlertSeverity::Page);
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: GatewayError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
