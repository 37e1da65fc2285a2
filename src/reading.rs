// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Readings, quality codes and dead-letter entries
//!
//! A [`Reading`] is immutable once written to the log. Quality is assigned by
//! the validator on a fresh copy, and corrections produce a new reading that
//! points back at the original through [`Reading::supersedes`].

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Data quality classification assigned by the validator
///
/// Ordered from best to worst so that the worst applicable verdict wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityCode {
    Good,
    Suspect,
    Uncertain,
    Bad,
}

impl QualityCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCode::Good => "GOOD",
            QualityCode::Suspect => "SUSPECT",
            QualityCode::Uncertain => "UNCERTAIN",
            QualityCode::Bad => "BAD",
        }
    }

    /// Whether readings with this code belong on the clean stream
    pub fn is_forwardable(&self) -> bool {
        !matches!(self, QualityCode::Bad)
    }
}

/// Kind of data point produced by a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    #[default]
    Telemetry,
    Event,
    Alarm,
}

/// Identity of a reading, used for duplicate detection and corrections
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadingKey {
    pub asset_id: String,
    pub parameter: String,
    /// Device timestamp in ms, or the gateway receipt time when the device gave none
    pub timestamp_ms: i64,
}

/// A single data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub asset_id: String,
    pub parameter: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub classification: Classification,
    /// Never set by collectors; assigned by the validator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityCode>,
    /// Device timestamp as RFC 3339 text, possibly missing or malformed
    #[serde(default)]
    pub device_time: Option<String>,
    /// Gateway receipt timestamp (ms since epoch)
    pub gateway_time_ms: u64,
    /// Estimated device clock skew (gateway - device), in ms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_skew_ms: Option<i64>,
    /// Producing component instance
    #[serde(default)]
    pub component_id: String,
    /// Original reading this one corrects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<ReadingKey>,
}

impl Reading {
    /// Create a raw telemetry reading with no device timestamp
    pub fn new(
        asset_id: impl Into<String>,
        parameter: impl Into<String>,
        value: f64,
        gateway_time_ms: u64,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            parameter: parameter.into(),
            value,
            unit: String::new(),
            classification: Classification::Telemetry,
            quality: None,
            device_time: None,
            gateway_time_ms,
            clock_skew_ms: None,
            component_id: String::new(),
            supersedes: None,
        }
    }

    /// Set the device timestamp from epoch milliseconds
    pub fn with_device_time_ms(mut self, device_ms: i64) -> Self {
        self.device_time = format_rfc3339(device_ms);
        self
    }

    /// Set the device timestamp verbatim
    pub fn with_device_time(mut self, device_time: impl Into<String>) -> Self {
        self.device_time = Some(device_time.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_component(mut self, component_id: impl Into<String>) -> Self {
        self.component_id = component_id.into();
        self
    }

    /// Parsed device timestamp in ms, `None` if missing or unparseable
    pub fn device_timestamp_ms(&self) -> Option<i64> {
        let text = self.device_time.as_deref()?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.timestamp_millis())
            .filter(|ms| *ms >= 0)
    }

    /// Event time used for windowing: device time when valid, else gateway time
    pub fn event_time_ms(&self) -> i64 {
        self.device_timestamp_ms()
            .unwrap_or(self.gateway_time_ms as i64)
    }

    /// Identity of this reading
    pub fn key(&self) -> ReadingKey {
        ReadingKey {
            asset_id: self.asset_id.clone(),
            parameter: self.parameter.clone(),
            timestamp_ms: self.event_time_ms(),
        }
    }

    /// Series identity `(asset, parameter)`
    pub fn series(&self) -> SeriesKey {
        SeriesKey {
            asset_id: self.asset_id.clone(),
            parameter: self.parameter.clone(),
        }
    }

    /// A new reading carrying the given quality. The original is untouched.
    pub fn classified(&self, quality: QualityCode) -> Reading {
        Reading {
            quality: Some(quality),
            ..self.clone()
        }
    }

    /// A new reading correcting this one with `value`
    pub fn correction(&self, value: f64, quality: QualityCode, now_ms: u64) -> Reading {
        Reading {
            value,
            quality: Some(quality),
            gateway_time_ms: now_ms,
            supersedes: Some(self.key()),
            ..self.clone()
        }
    }
}

/// `(asset, parameter)` pair identifying one measured series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub asset_id: String,
    pub parameter: String,
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.asset_id, self.parameter)
    }
}

/// Format epoch milliseconds as RFC 3339 (UTC, millisecond precision)
pub fn format_rfc3339(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Why a reading was classified BAD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RangeViolation,
    InvalidValue,
    Duplicate,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RangeViolation => "range_violation",
            FailureReason::InvalidValue => "invalid_value",
            FailureReason::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A BAD reading with its failure reason, as appended to the dead-letter stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub reading: Reading,
    pub reason: FailureReason,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_correction: Option<f64>,
}

/// Operator decision on a dead-letter entry, taken in the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeadLetterDecision {
    /// Re-ingest, optionally with a corrected value
    Approve {
        entry: DeadLetterEntry,
        #[serde(default)]
        corrected_value: Option<f64>,
    },
    /// Leave the entry in the dead-letter stream and do nothing
    Discard { entry: DeadLetterEntry },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_ordering() {
        assert!(QualityCode::Good < QualityCode::Suspect);
        assert!(QualityCode::Suspect < QualityCode::Uncertain);
        assert!(QualityCode::Uncertain < QualityCode::Bad);
        assert!(!QualityCode::Bad.is_forwardable());
        assert!(QualityCode::Uncertain.is_forwardable());
    }

    #[test]
    fn test_device_time_parsing() {
        let r = Reading::new("press-1", "temp", 21.0, 5_000).with_device_time_ms(1_000);
        assert_eq!(r.device_timestamp_ms(), Some(1_000));
        assert_eq!(r.event_time_ms(), 1_000);

        let bad = Reading::new("press-1", "temp", 21.0, 5_000).with_device_time("yesterday");
        assert_eq!(bad.device_timestamp_ms(), None);
        assert_eq!(bad.event_time_ms(), 5_000);
    }

    #[test]
    fn test_classified_does_not_mutate_original() {
        let raw = Reading::new("a", "p", 1.0, 0);
        let clean = raw.classified(QualityCode::Suspect);
        assert_eq!(raw.quality, None);
        assert_eq!(clean.quality, Some(QualityCode::Suspect));
    }

    #[test]
    fn test_correction_references_original() {
        let raw = Reading::new("a", "p", 900.0, 10).with_device_time_ms(7);
        let fixed = raw.correction(90.0, QualityCode::Suspect, 20);
        assert_eq!(fixed.supersedes, Some(raw.key()));
        assert_eq!(fixed.value, 90.0);
        assert_eq!(raw.value, 900.0);
    }

    #[test]
    fn test_serde_shape() {
        let r = Reading::new("a", "p", 1.5, 0).classified(QualityCode::Good);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"quality\":\"GOOD\""));
        assert!(json.contains("\"classification\":\"telemetry\""));
        let back: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_failure_reason_names() {
        assert_eq!(FailureReason::RangeViolation.as_str(), "range_violation");
        assert_eq!(
            serde_json::to_string(&FailureReason::InvalidValue).unwrap(),
            "\"invalid_value\""
        );
    }
}
