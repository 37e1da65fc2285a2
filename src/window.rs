// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Aggregation resolutions and rollup records.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// A tumbling-window width with a short name (`1m`, `15m`, `1h`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub name: String,
    pub width_ms: u64,
}

impl Resolution {
    pub fn new(name: impl Into<String>, width_ms: u64) -> Self {
        Self {
            name: name.into(),
            width_ms,
        }
    }

    /// Parse `<n>s`, `<n>m`, `<n>h` or `<n>d`
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| GatewayError::Config(format!("resolution '{}' has no unit", text)))?;
        let (digits, unit) = text.split_at(split);
        let n: u64 = digits
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid resolution '{}'", text)))?;
        let unit_ms = match unit {
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            _ => {
                return Err(GatewayError::Config(format!(
                    "unknown resolution unit '{}' in '{}'",
                    unit, text
                )))
            }
        };
        if n == 0 {
            return Err(GatewayError::Config(format!(
                "resolution '{}' must be positive",
                text
            )));
        }
        let width_ms = n
            .checked_mul(unit_ms)
            .filter(|w| *w <= i64::MAX as u64)
            .ok_or_else(|| {
                GatewayError::Config(format!("resolution '{}' is out of range", text))
            })?;
        Ok(Self::new(text, width_ms))
    }

    /// Start of the window containing `timestamp_ms`
    pub fn window_start(&self, timestamp_ms: i64) -> i64 {
        let width = self.width_ms as i64;
        timestamp_ms.div_euclid(width) * width
    }

    pub fn defaults() -> Vec<Resolution> {
        vec![
            Resolution::new("1m", 60_000),
            Resolution::new("15m", 900_000),
            Resolution::new("1h", 3_600_000),
        ]
    }
}

/// Statistical summary of one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub count: u64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Per-quality sample counts of one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCounts {
    pub good: u64,
    pub suspect: u64,
    pub uncertain: u64,
}

/// One flushed rollup for `(asset, parameter, resolution, window)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateWindow {
    pub asset_id: String,
    pub parameter: String,
    pub resolution: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub summary: Summary,
    pub quality: QualityCounts,
    /// 0 for the first emission, incremented when a late reading reopens it
    #[serde(default)]
    pub revision: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(Resolution::parse("1m").unwrap().width_ms, 60_000);
        assert_eq!(Resolution::parse("15m").unwrap().width_ms, 900_000);
        assert_eq!(Resolution::parse("2h").unwrap().width_ms, 7_200_000);
        assert!(Resolution::parse("m").is_err());
        assert!(Resolution::parse("10").is_err());
        assert!(Resolution::parse("0s").is_err());
        assert!(Resolution::parse("5y").is_err());
    }

    #[test]
    fn test_parse_resolution_overflow() {
        assert!(matches!(
            Resolution::parse("307445734561825861m"),
            Err(GatewayError::Config(_))
        ));
        // Fits u64 but not the signed window arithmetic
        assert!(Resolution::parse("9223372036854776s").is_err());
        assert!(Resolution::parse("106751991167d").is_ok());
    }

    #[test]
    fn test_window_start_alignment() {
        let r = Resolution::new("1m", 60_000);
        assert_eq!(r.window_start(0), 0);
        assert_eq!(r.window_start(59_999), 0);
        assert_eq!(r.window_start(60_000), 60_000);
        assert_eq!(r.window_start(-1), -60_000);
    }
}
