// Edgeloop Daemon - Offline CSV replay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Offline replay of recorded readings.
//!
//! Runs a CSV of readings through the same validator and aggregator the
//! gateway uses, without a log or any components, and summarises what the
//! live pipeline would have produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use edgeloop::{AggregateWindow, GatewayConfig, GatewayError, Reading};
use edgeloop_gateway::{aggregator_config, rules_for_stream};
use edgeloop_quality::{
    Aggregator, AggregatorStats, Output, QualityValidator, ValidatorConfig, ValidatorStats,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Columns expected in the CSV header
pub const COLUMNS: [&str; 5] = ["asset_id", "parameter", "value", "unit", "device_time"];

/// Replay configuration.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    pub csv_path: PathBuf,
    /// Gateway config providing validation rules and resolutions
    pub config_path: Option<PathBuf>,
    /// Include every emitted window in the summary
    pub include_windows: bool,
}

/// One CSV row.
#[derive(Debug, Clone, Deserialize)]
struct Row {
    asset_id: String,
    parameter: String,
    value: f64,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    device_time: String,
}

/// What the pipeline produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub rows: usize,
    pub config_version: u64,
    /// Records per output topic
    pub outputs: BTreeMap<String, u64>,
    pub validators: BTreeMap<String, ValidatorStats>,
    pub aggregator: AggregatorStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<AggregateWindow>,
}

/// Replay errors.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Empty dataset")]
    EmptyDataset,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Validator and aggregator state for one replay
pub struct ReplayEngine {
    config: GatewayConfig,
    validators: BTreeMap<String, QualityValidator>,
    aggregator: Aggregator,
    summary: ReplaySummary,
    include_windows: bool,
    last_time_ms: u64,
}

impl ReplayEngine {
    pub fn new(config: GatewayConfig, include_windows: bool) -> Self {
        let aggregator = Aggregator::new(aggregator_config(&config));
        let summary = ReplaySummary {
            config_version: config.version,
            ..Default::default()
        };
        Self {
            config,
            validators: BTreeMap::new(),
            aggregator,
            summary,
            include_windows,
            last_time_ms: 0,
        }
    }

    /// Raw stream a collector for `asset_id` writes to, if any
    fn stream_for(&self, asset_id: &str) -> String {
        self.config
            .pipelines
            .iter()
            .find(|p| p.asset_id == asset_id && p.output_stream.is_some())
            .and_then(|p| p.output_stream.clone())
            .unwrap_or_else(|| format!("raw.{}", asset_id))
    }

    fn record_windows(&mut self, windows: Vec<AggregateWindow>) {
        for w in &windows {
            *self
                .summary
                .outputs
                .entry(edgeloop::topics::rollup(&w.resolution))
                .or_default() += 1;
        }
        if self.include_windows {
            self.summary.windows.extend(windows);
        }
    }

    /// Validate one reading and feed its clean output to the aggregator
    pub fn push(&mut self, mut reading: Reading) {
        // Replayed data carries no receipt time; device time stands in for it
        if let Some(device_ms) = reading.device_timestamp_ms() {
            self.last_time_ms = device_ms.max(0) as u64;
        }
        reading.gateway_time_ms = self.last_time_ms;
        self.summary.rows += 1;

        let stream = self.stream_for(&reading.asset_id);
        let validator = match self.validators.get_mut(&stream) {
            Some(v) => v,
            None => {
                let (rules, poll) = rules_for_stream(&self.config, &stream);
                debug!(stream = %stream, parameters = rules.parameters.len(), "validator created");
                self.validators.entry(stream.clone()).or_insert_with(|| {
                    QualityValidator::new(rules, ValidatorConfig::default().with_poll_interval(poll))
                })
            }
        };

        let mut windows = Vec::new();
        for output in validator.validate(&reading).outputs() {
            *self
                .summary
                .outputs
                .entry(output.topic().to_string())
                .or_default() += 1;
            if let Output::Clean(clean) = &output {
                windows.extend(self.aggregator.ingest(clean, None));
            }
        }
        self.record_windows(windows);
    }

    /// Flush every open window and return the summary
    pub fn finish(mut self) -> ReplaySummary {
        let windows = self.aggregator.flush_expired(i64::MAX as u64);
        self.record_windows(windows);
        self.summary.validators = self
            .validators
            .iter()
            .map(|(stream, v)| (stream.clone(), v.stats()))
            .collect();
        self.summary.aggregator = self.aggregator.stats();
        self.summary
    }
}

fn parse_row(row: Row) -> Reading {
    let mut reading = Reading::new(row.asset_id, row.parameter, row.value, 0).with_unit(row.unit);
    let device_time = row.device_time.trim();
    if !device_time.is_empty() {
        reading = reading.with_device_time(device_time);
    }
    reading
}

/// Read and check the CSV rows.
fn parse_csv(path: &Path) -> Result<Vec<Reading>, ReplayError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    for column in ["asset_id", "parameter", "value"] {
        if !headers.iter().any(|h| h == column) {
            return Err(ReplayError::InvalidFormat(format!(
                "missing column '{}', expected {}",
                column,
                COLUMNS.join(",")
            )));
        }
    }

    let mut readings = Vec::new();
    for (line, result) in reader.deserialize::<Row>().enumerate() {
        let row = result.map_err(|e| {
            ReplayError::InvalidFormat(format!("row {}: {}", line + 2, e))
        })?;
        readings.push(parse_row(row));
    }
    Ok(readings)
}

/// Replay a CSV file and summarise the result.
pub fn run(config: &ReplayConfig) -> Result<ReplaySummary, ReplayError> {
    if !config.csv_path.exists() {
        return Err(ReplayError::FileNotFound(
            config.csv_path.display().to_string(),
        ));
    }
    let gateway_config = match &config.config_path {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::empty("replay"),
    };

    let readings = parse_csv(&config.csv_path)?;
    if readings.is_empty() {
        return Err(ReplayError::EmptyDataset);
    }
    info!(
        rows = readings.len(),
        config_version = gateway_config.version,
        "replaying dataset"
    );

    let mut engine = ReplayEngine::new(gateway_config, config.include_windows);
    for reading in readings {
        engine.push(reading);
    }
    Ok(engine.finish())
}
