// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Topic catalogue and eviction priorities

use serde::{Deserialize, Serialize};

/// Validated readings (GOOD / SUSPECT / UNCERTAIN)
pub const CLEAN: &str = "readings.clean";
/// BAD readings with failure reasons
pub const DEAD_LETTER: &str = "readings.deadletter";
/// Operator decisions on dead-letter entries
pub const DEAD_LETTER_DECISIONS: &str = "readings.deadletter.decisions";
/// Synthetic gap events
pub const EVENTS: &str = "readings.events";
/// Mirror of alarm-classified readings
pub const ALARMS: &str = "readings.alarms";
/// Overflow governor audit trail
pub const OVERFLOW: &str = "gateway.overflow";
/// Alerts raised by the control loop
pub const ALERTS: &str = "gateway.alerts";
/// Health rollups
pub const HEALTH: &str = "gateway.health";

const ROLLUP_PREFIX: &str = "rollups.";

/// Topic carrying rollups of the given resolution
pub fn rollup(resolution: &str) -> String {
    format!("{ROLLUP_PREFIX}{resolution}")
}

pub fn is_rollup(topic: &str) -> bool {
    topic.starts_with(ROLLUP_PREFIX)
}

/// Topics owned by the control loop itself; pipelines may not write to them
pub fn is_reserved(topic: &str) -> bool {
    matches!(
        topic,
        CLEAN | DEAD_LETTER | DEAD_LETTER_DECISIONS | EVENTS | ALARMS | OVERFLOW | ALERTS | HEALTH
    ) || is_rollup(topic)
}

/// Topics that are never evicted, whatever the configuration says
pub fn is_always_critical(topic: &str) -> bool {
    matches!(topic, DEAD_LETTER | DEAD_LETTER_DECISIONS | ALARMS | OVERFLOW)
}

/// Eviction priority of a topic. Lower priorities are evicted first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TopicPriority {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl TopicPriority {
    /// Priorities eligible for eviction, in eviction order
    pub const EVICTABLE: [TopicPriority; 3] =
        [TopicPriority::Low, TopicPriority::Medium, TopicPriority::High];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicPriority::Low => "low",
            TopicPriority::Medium => "medium",
            TopicPriority::High => "high",
            TopicPriority::Critical => "critical",
        }
    }
}
