//! Health primitives for the gateway
//!
//! Component-level checks and the roll-up rule that turns them, together with
//! the overflow tier, into one gateway status.

use serde::{Deserialize, Serialize};

/// Health status of a component or of the whole gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Everything running, storage pressure at most advisory
    #[default]
    Healthy,
    /// Degraded but functional
    Degraded,
    /// A critical component failed or storage is being evicted
    Unhealthy,
    /// No reachable report path. Only an external observer assigns this.
    Offline,
}

impl HealthStatus {
    /// Check if the status is operational (healthy or degraded)
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Check if the status is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Offline => "OFFLINE",
        }
    }
}

/// Health of one supervised component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Component name (pipeline id)
    pub component: String,
    /// Lifecycle state name, as reported by the supervisor
    pub state: String,
    pub status: HealthStatus,
    pub critical: bool,
    /// Details message
    pub message: String,
}

impl HealthCheck {
    /// Create a healthy check result
    pub fn healthy(component: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            state: state.into(),
            status: HealthStatus::Healthy,
            critical: false,
            message: "OK".to_string(),
        }
    }

    /// Create a degraded check result
    pub fn degraded(
        component: impl Into<String>,
        state: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            state: state.into(),
            status: HealthStatus::Degraded,
            critical: false,
            message: message.into(),
        }
    }

    /// Create an unhealthy check result
    pub fn unhealthy(
        component: impl Into<String>,
        state: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            state: state.into(),
            status: HealthStatus::Unhealthy,
            critical: false,
            message: message.into(),
        }
    }

    /// Mark the component as critical for the gateway
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }
}

/// One published gateway status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRollup {
    pub gateway_id: String,
    pub status: HealthStatus,
    /// Active (health-confirmed) config version
    pub config_version: u64,
    /// Overflow tier, 1 (no pressure) to 5 (writes blocked)
    pub overflow_tier: u8,
    pub storage_used_pct: f64,
    pub components: Vec<HealthCheck>,
    pub generated_at_ms: u64,
}

impl HealthRollup {
    /// Human-readable report, one line per component
    pub fn report(&self) -> String {
        let mut report = format!(
            "Gateway {} v{}: {} (tier {}, storage {:.1}%)\n",
            self.gateway_id,
            self.config_version,
            self.status.as_str(),
            self.overflow_tier,
            self.storage_used_pct
        );
        for check in &self.components {
            report.push_str(&format!(
                "[{}] {} {}{} - {}\n",
                check.status.as_str(),
                check.component,
                check.state,
                if check.critical { " (critical)" } else { "" },
                check.message
            ));
        }
        report
    }
}

/// Roll component checks and the overflow tier up into one gateway status
///
/// - UNHEALTHY: a critical component is unhealthy, or tier 4 or above
/// - DEGRADED: any component not healthy, or tier 2-3
/// - HEALTHY: otherwise
pub fn roll_up(checks: &[HealthCheck], overflow_tier: u8) -> HealthStatus {
    let critical_down = checks
        .iter()
        .any(|c| c.critical && c.status == HealthStatus::Unhealthy);
    if critical_down || overflow_tier >= 4 {
        return HealthStatus::Unhealthy;
    }
    let any_unwell = checks.iter().any(|c| !c.status.is_healthy());
    if any_unwell || overflow_tier >= 2 {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}
