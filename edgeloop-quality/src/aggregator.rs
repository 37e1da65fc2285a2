// Edgeloop Quality - Validation and aggregation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Multi-resolution tumbling-window aggregation
//!
//! Every `(asset, parameter, resolution)` keeps its open windows keyed by
//! window start. A window is flushed once the series' event-time watermark
//! (latest event time seen, minus the allowed lateness) reaches its end, or
//! when [`Aggregator::flush_expired`] is called with a wall-clock time past it.
//!
//! Readings for a window that was already flushed are late: they are dropped
//! from aggregation under [`LatePolicy::DropClosed`], or fold into a retained
//! copy of the window that is re-emitted with a higher revision under
//! [`LatePolicy::Reopen`].

use std::collections::{BTreeMap, HashMap, VecDeque};

use edgeloop::{
    AggregateWindow, Classification, LatePolicy, QualityCode, Reading, Resolution, SeriesKey,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::stats::WindowAccumulator;

/// Aggregator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub resolutions: Vec<Resolution>,
    pub late_policy: LatePolicy,
    /// How far behind the watermark a window end may be before it flushes
    pub allowed_lateness_ms: u64,
    /// Flushed windows kept per series and resolution for reopening
    pub reopen_retention: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            resolutions: Resolution::defaults(),
            late_policy: LatePolicy::DropClosed,
            allowed_lateness_ms: 0,
            reopen_retention: 16,
        }
    }
}

impl AggregatorConfig {
    pub fn with_resolutions(mut self, resolutions: Vec<Resolution>) -> Self {
        self.resolutions = resolutions;
        self
    }

    pub fn with_late_policy(mut self, late_policy: LatePolicy) -> Self {
        self.late_policy = late_policy;
        self
    }

    pub fn with_allowed_lateness(mut self, allowed_lateness_ms: u64) -> Self {
        self.allowed_lateness_ms = allowed_lateness_ms;
        self
    }
}

/// Running counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorStats {
    pub accepted: u64,
    pub skipped: u64,
    pub flushed: u64,
    pub late_dropped: u64,
    pub revisions: u64,
}

#[derive(Debug, Clone)]
struct OpenWindow {
    acc: WindowAccumulator,
    /// Lowest source offset folded into this window
    first_offset: Option<u64>,
    revision: u32,
}

impl OpenWindow {
    fn new() -> Self {
        Self {
            acc: WindowAccumulator::new(),
            first_offset: None,
            revision: 0,
        }
    }

    fn add(&mut self, value: f64, quality: QualityCode, offset: Option<u64>) {
        self.acc.add_sample(value, quality);
        if let Some(offset) = offset {
            self.first_offset = Some(self.first_offset.map_or(offset, |o| o.min(offset)));
        }
    }
}

#[derive(Debug, Default)]
struct SeriesWindows {
    open: BTreeMap<i64, OpenWindow>,
    /// Windows starting before this are closed
    closed_before: Option<i64>,
    watermark: Option<i64>,
    /// Recently flushed windows, oldest first, for reopening
    flushed: VecDeque<(i64, OpenWindow)>,
}

/// Aggregates clean readings into windowed rollups
pub struct Aggregator {
    config: AggregatorConfig,
    series: HashMap<(SeriesKey, usize), SeriesWindows>,
    stats: AggregatorStats,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    /// Number of windows currently accumulating
    pub fn open_windows(&self) -> usize {
        self.series.values().map(|s| s.open.len()).sum()
    }

    /// Fold one clean reading in; returns windows flushed or revised by it
    ///
    /// `offset` is the reading's position in the clean stream, used for
    /// [`Aggregator::commit_floor`].
    pub fn ingest(&mut self, reading: &Reading, offset: Option<u64>) -> Vec<AggregateWindow> {
        let quality = match reading.quality {
            Some(q) if q.is_forwardable() => q,
            _ => {
                self.stats.skipped += 1;
                return Vec::new();
            }
        };
        if reading.classification != Classification::Telemetry || !reading.value.is_finite() {
            self.stats.skipped += 1;
            return Vec::new();
        }
        self.stats.accepted += 1;

        let ts = reading.event_time_ms();
        let series_key = reading.series();
        let lateness = self.config.allowed_lateness_ms as i64;
        let mut emitted = Vec::new();

        for (idx, resolution) in self.config.resolutions.iter().enumerate() {
            let windows = self
                .series
                .entry((series_key.clone(), idx))
                .or_default();
            let start = resolution.window_start(ts);

            if windows.closed_before.is_some_and(|closed| start < closed) {
                match self.config.late_policy {
                    LatePolicy::Reopen => {
                        if let Some((_, window)) =
                            windows.flushed.iter_mut().find(|(s, _)| *s == start)
                        {
                            window.add(reading.value, quality, None);
                            window.revision += 1;
                            self.stats.revisions += 1;
                            debug!(
                                series = %series_key,
                                resolution = %resolution.name,
                                window_start_ms = start,
                                revision = window.revision,
                                "window reopened"
                            );
                            emitted.push(to_aggregate(&series_key, resolution, start, window));
                            continue;
                        }
                        self.stats.late_dropped += 1;
                    }
                    LatePolicy::DropClosed => self.stats.late_dropped += 1,
                }
                trace!(series = %series_key, window_start_ms = start, "late reading dropped");
                continue;
            }

            windows
                .open
                .entry(start)
                .or_insert_with(OpenWindow::new)
                .add(reading.value, quality, offset);

            let watermark = windows.watermark.map_or(ts, |w| w.max(ts));
            windows.watermark = Some(watermark);

            let flushed = flush_until(
                windows,
                &series_key,
                resolution,
                watermark - lateness,
                self.config.reopen_retention,
            );
            self.stats.flushed += flushed.len() as u64;
            emitted.extend(flushed);
        }
        emitted
    }

    /// Flush every window whose end plus the allowed lateness is at or before `now_ms`
    pub fn flush_expired(&mut self, now_ms: u64) -> Vec<AggregateWindow> {
        let horizon = now_ms as i64 - self.config.allowed_lateness_ms as i64;
        let mut emitted = Vec::new();
        let mut keys: Vec<_> = self.series.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let Some(windows) = self.series.get_mut(&key) else {
                continue;
            };
            let resolution = &self.config.resolutions[key.1];
            emitted.extend(flush_until(
                windows,
                &key.0,
                resolution,
                horizon,
                self.config.reopen_retention,
            ));
        }
        self.stats.flushed += emitted.len() as u64;
        emitted
    }

    /// Lowest source offset still held by an open window
    ///
    /// Committing beyond it would lose those readings on a restart. `None`
    /// when nothing is open.
    pub fn commit_floor(&self) -> Option<u64> {
        self.series
            .values()
            .flat_map(|s| s.open.values())
            .filter_map(|w| w.first_offset)
            .min()
    }
}

fn flush_until(
    windows: &mut SeriesWindows,
    series: &SeriesKey,
    resolution: &Resolution,
    horizon: i64,
    retention: usize,
) -> Vec<AggregateWindow> {
    let width = resolution.width_ms as i64;
    let mut emitted = Vec::new();
    while let Some((&start, _)) = windows.open.first_key_value() {
        if start + width > horizon {
            break;
        }
        let Some((start, window)) = windows.open.pop_first() else {
            break;
        };
        emitted.push(to_aggregate(series, resolution, start, &window));
        windows.closed_before = Some(windows.closed_before.map_or(start + width, |c| c.max(start + width)));
        if retention > 0 {
            windows.flushed.push_back((start, window));
            while windows.flushed.len() > retention {
                windows.flushed.pop_front();
            }
        }
    }
    emitted
}

fn to_aggregate(
    series: &SeriesKey,
    resolution: &Resolution,
    start: i64,
    window: &OpenWindow,
) -> AggregateWindow {
    AggregateWindow {
        asset_id: series.asset_id.clone(),
        parameter: series.parameter.clone(),
        resolution: resolution.name.clone(),
        window_start_ms: start,
        window_end_ms: start + resolution.width_ms as i64,
        summary: window.acc.summary(),
        quality: window.acc.quality(),
        revision: window.revision,
    }
}
