// Edgeloop Quality - Validation and aggregation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Window statistics.

use edgeloop::{QualityCode, QualityCounts, Summary};
use serde::{Deserialize, Serialize};

/// Samples and quality counts of one window
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowAccumulator {
    samples: Vec<f64>,
    sum: f64,
    min: f64,
    max: f64,
    quality: QualityCounts,
}

impl WindowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, value: f64, quality: QualityCode) {
        if self.samples.is_empty() {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.samples.push(value);
        self.sum += value;
        match quality {
            QualityCode::Good => self.quality.good += 1,
            QualityCode::Suspect => self.quality.suspect += 1,
            QualityCode::Uncertain => self.quality.uncertain += 1,
            QualityCode::Bad => {}
        }
    }

    pub fn count(&self) -> u64 {
        self.samples.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn quality(&self) -> QualityCounts {
        self.quality
    }

    /// Summary over all samples. Population standard deviation,
    /// linearly interpolated percentiles.
    pub fn summary(&self) -> Summary {
        let n = self.samples.len();
        if n == 0 {
            return Summary {
                count: 0,
                avg: 0.0,
                min: 0.0,
                max: 0.0,
                stddev: 0.0,
                p50: 0.0,
                p90: 0.0,
                p95: 0.0,
                p99: 0.0,
            };
        }
        let avg = self.sum / n as f64;
        let variance = self
            .samples
            .iter()
            .map(|v| (v - avg).powi(2))
            .sum::<f64>()
            / n as f64;

        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);

        Summary {
            count: n as u64,
            avg,
            min: self.min,
            max: self.max,
            stddev: variance.max(0.0).sqrt(),
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }
}

/// Percentile of sorted samples with linear interpolation between ranks
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_summary() {
        let acc = WindowAccumulator::new();
        assert!(acc.is_empty());
        assert_eq!(acc.summary().count, 0);
    }

    #[test]
    fn test_summary_values() {
        let mut acc = WindowAccumulator::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.add_sample(v, QualityCode::Good);
        }
        let s = acc.summary();
        assert_eq!(s.count, 8);
        assert_relative_eq!(s.avg, 5.0);
        assert_relative_eq!(s.stddev, 2.0);
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 9.0);
        assert_relative_eq!(s.p50, 4.5);
    }

    #[test]
    fn test_percentiles() {
        let sorted: Vec<f64> = (1..=101).map(|v| v as f64).collect();
        assert_relative_eq!(percentile(&sorted, 50.0), 51.0);
        assert_relative_eq!(percentile(&sorted, 90.0), 91.0);
        assert_relative_eq!(percentile(&sorted, 99.0), 100.0);
        assert_eq!(percentile(&[3.0], 95.0), 3.0);
    }

    #[test]
    fn test_quality_counts() {
        let mut acc = WindowAccumulator::new();
        acc.add_sample(1.0, QualityCode::Good);
        acc.add_sample(1.0, QualityCode::Suspect);
        acc.add_sample(1.0, QualityCode::Uncertain);
        acc.add_sample(1.0, QualityCode::Uncertain);
        let q = acc.quality();
        assert_eq!((q.good, q.suspect, q.uncertain), (1, 1, 2));
    }
}
