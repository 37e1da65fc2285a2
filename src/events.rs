// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Overflow audit events and alerts.

use serde::{Deserialize, Serialize};

use crate::error::{AlertSeverity, GatewayError};

/// Mitigation recorded in the overflow audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    /// Raw-resolution data past retention deleted
    PurgeRaw,
    /// Oldest data evicted by ascending topic priority
    Evict,
    /// Log stopped admitting writes
    Block,
    /// Log admits writes again
    Unblock,
}

/// One eviction or block transition. Append-only, never itself evicted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverflowEvent {
    pub at_ms: u64,
    /// Tier that triggered the action (1-5)
    pub tier: u8,
    pub action: OverflowAction,
    pub bytes_freed: u64,
    /// Oldest and newest record timestamp removed, if anything was removed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evicted_range_ms: Option<(u64, u64)>,
    pub affected_topics: Vec<String>,
    pub usage_before_pct: f64,
    pub usage_after_pct: f64,
}

/// Alert raised by the control loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub at_ms: u64,
    pub severity: AlertSeverity,
    /// Unit that raised it (`governor`, `supervisor`, `reconciler`, ...)
    pub source: String,
    pub message: String,
}

impl Alert {
    pub fn new(
        at_ms: u64,
        severity: AlertSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            at_ms,
            severity,
            source: source.into(),
            message: message.into(),
        }
    }

    /// Alert for an observed error, at the error's own severity
    pub fn from_error(at_ms: u64, source: impl Into<String>, err: &GatewayError) -> Self {
        Self::new(at_ms, err.severity(), source, err.to_string())
    }
}
