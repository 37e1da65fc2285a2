// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Gateway and pipeline configuration
//!
//! A [`GatewayConfig`] is immutable once accepted: a new version replaces the
//! old one wholesale. Readers hold an `Arc<GatewayConfig>` for the duration of
//! an operation, so a version swap is never observed half-applied.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::{GatewayError, Result};
use crate::topics::{self, TopicPriority};
use crate::window::Resolution;

const CACHE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Top-level, versioned configuration for one gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub gateway_id: String,
    /// Monotonic version assigned by the control plane
    pub version: u64,
    /// Ordered pipeline set
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub settings: GlobalSettings,
}

/// Whether a component produces readings or ships them out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Collector,
    Exporter,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Collector => "collector",
            ComponentKind::Exporter => "exporter",
        }
    }
}

/// One device integration (collector) or destination (exporter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub kind: ComponentKind,
    /// Container image reference
    pub image: String,
    #[serde(default)]
    pub version: String,
    /// Opaque protocol parameters handed to the component as-is
    #[serde(default)]
    pub protocol: serde_json::Value,
    /// Stream a collector writes raw readings to
    #[serde(default)]
    pub output_stream: Option<String>,
    /// Stream an exporter reads from
    #[serde(default)]
    pub input_stream: Option<String>,
    #[serde(default)]
    pub asset_id: String,
    /// Expected polling cadence of the device
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub validation: ValidationRules,
    #[serde(default)]
    pub limits: ResourceLimits,
    /// A FAILED critical pipeline makes the whole gateway UNHEALTHY
    #[serde(default)]
    pub critical: bool,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

/// Per-parameter validation rules of a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterRule>,
    /// Rules of one asset, taking precedence over `parameters`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: BTreeMap<String, BTreeMap<String, ParameterRule>>,
}

impl ValidationRules {
    pub fn rule(&self, parameter: &str) -> Option<&ParameterRule> {
        self.parameters.get(parameter)
    }

    /// Rule for `parameter` of `asset_id`, falling back to the shared rules
    pub fn rule_for(&self, asset_id: &str, parameter: &str) -> Option<&ParameterRule> {
        self.assets
            .get(asset_id)
            .and_then(|rules| rules.get(parameter))
            .or_else(|| self.rule(parameter))
    }

    pub fn insert_for_asset(
        &mut self,
        asset_id: impl Into<String>,
        parameter: impl Into<String>,
        rule: ParameterRule,
    ) {
        self.assets
            .entry(asset_id.into())
            .or_default()
            .insert(parameter.into(), rule);
    }
}

/// Range and rate-of-change limits for one parameter
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterRule {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Largest accepted absolute change between consecutive accepted values
    #[serde(default)]
    pub max_delta: Option<f64>,
}

impl ParameterRule {
    pub fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            max_delta: None,
        }
    }

    pub fn with_max_delta(mut self, max_delta: f64) -> Self {
        self.max_delta = Some(max_delta);
        self
    }
}

/// Hard resource ceilings applied when a component is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// CPU quota in millicores (1000 = one core)
    pub cpu_millis: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_millis: 500,
        }
    }
}

/// What the aggregator does with a reading whose window was already flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Flushed windows are closed; late readings skip aggregation
    #[default]
    DropClosed,
    /// Recently flushed windows are recomputed and re-emitted as a revision
    Reopen,
}

/// Storage limits and tier thresholds (percent of capacity)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    pub compress_at_pct: f64,
    pub purge_raw_at_pct: f64,
    pub evict_at_pct: f64,
    pub block_at_pct: f64,
    /// Raw-resolution data older than this is deleted in the purge tier
    pub raw_retention_ms: u64,
    /// Segments older than this are eligible for compression
    pub compress_after_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            compress_at_pct: 70.0,
            purge_raw_at_pct: 80.0,
            evict_at_pct: 90.0,
            block_at_pct: 95.0,
            raw_retention_ms: 3_600_000,
            compress_after_ms: 600_000,
        }
    }
}

/// Settings shared by every pipeline of a config version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub storage: StorageSettings,
    /// Explicit eviction priorities; unlisted topics get a default
    #[serde(default)]
    pub topic_priorities: BTreeMap<String, TopicPriority>,
    /// Aggregation resolutions, e.g. `["1m", "15m", "1h"]`
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<String>,
    #[serde(default)]
    pub late_policy: LatePolicy,
}

fn default_resolutions() -> Vec<String> {
    vec!["1m".into(), "15m".into(), "1h".into()]
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            storage: StorageSettings::default(),
            topic_priorities: BTreeMap::new(),
            resolutions: default_resolutions(),
            late_policy: LatePolicy::default(),
        }
    }
}

impl GatewayConfig {
    /// Empty config, used as the baseline for the very first reconciliation
    pub fn empty(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            version: 0,
            pipelines: Vec::new(),
            settings: GlobalSettings::default(),
        }
    }

    /// Parse and validate a config document
    pub fn from_json(text: &str) -> Result<Self> {
        let config: GatewayConfig = serde_json::from_str(text)
            .map_err(|e| GatewayError::Config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Structural validation. Any failure aborts reconciliation of this version.
    pub fn validate(&self) -> Result<()> {
        if self.gateway_id.trim().is_empty() {
            return Err(GatewayError::Config("gateway_id must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for p in &self.pipelines {
            if p.pipeline_id.trim().is_empty() {
                return Err(GatewayError::Config("pipeline_id must not be empty".into()));
            }
            if !seen.insert(p.pipeline_id.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate pipeline_id '{}'",
                    p.pipeline_id
                )));
            }
            p.validate()?;
        }

        for r in &self.settings.resolutions {
            Resolution::parse(r)?;
        }

        let s = &self.settings.storage;
        let ladder = [
            s.compress_at_pct,
            s.purge_raw_at_pct,
            s.evict_at_pct,
            s.block_at_pct,
        ];
        if ladder.windows(2).any(|w| w[0] >= w[1]) || ladder[0] <= 0.0 || ladder[3] > 100.0 {
            return Err(GatewayError::Config(
                "storage tier thresholds must be strictly increasing within (0, 100]".into(),
            ));
        }

        Ok(())
    }

    pub fn pipeline(&self, pipeline_id: &str) -> Option<&PipelineConfig> {
        self.pipelines.iter().find(|p| p.pipeline_id == pipeline_id)
    }

    /// Parsed aggregation resolutions (invalid entries are rejected by `validate`)
    pub fn resolutions(&self) -> Vec<Resolution> {
        self.settings
            .resolutions
            .iter()
            .filter_map(|r| Resolution::parse(r).ok())
            .collect()
    }

    /// Raw reading streams written by collectors
    pub fn raw_streams(&self) -> Vec<String> {
        let mut streams: Vec<String> = self
            .pipelines
            .iter()
            .filter(|p| p.kind == ComponentKind::Collector)
            .filter_map(|p| p.output_stream.clone())
            .collect();
        streams.sort();
        streams.dedup();
        streams
    }

    /// Topics holding raw-resolution data (purged first under pressure)
    pub fn raw_resolution_topics(&self) -> Vec<String> {
        let mut topics = self.raw_streams();
        topics.push(topics::CLEAN.to_string());
        topics
    }

    /// Eviction priority of a topic
    pub fn priority_of(&self, topic: &str) -> TopicPriority {
        if topics::is_always_critical(topic) {
            return TopicPriority::Critical;
        }
        if let Some(p) = self.settings.topic_priorities.get(topic) {
            return *p;
        }
        if topics::is_rollup(topic) || topic == topics::ALERTS || topic == topics::HEALTH {
            TopicPriority::High
        } else if topic == topics::CLEAN || topic == topics::EVENTS {
            TopicPriority::Medium
        } else {
            TopicPriority::Low
        }
    }

    /// Stable fingerprint of the canonical JSON form
    pub fn fingerprint(&self) -> u64 {
        match serde_json::to_vec(self) {
            Ok(bytes) => xxh64(&bytes, 0),
            Err(_) => 0,
        }
    }
}

impl PipelineConfig {
    /// Minimal collector pipeline, mostly for tests and tooling
    pub fn collector(
        pipeline_id: impl Into<String>,
        asset_id: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        let pipeline_id = pipeline_id.into();
        Self {
            output_stream: Some(format!("raw.{}", pipeline_id)),
            pipeline_id,
            kind: ComponentKind::Collector,
            image: image.into(),
            version: String::new(),
            protocol: serde_json::Value::Null,
            input_stream: None,
            asset_id: asset_id.into(),
            poll_interval_ms: default_poll_interval_ms(),
            validation: ValidationRules::default(),
            limits: ResourceLimits::default(),
            critical: false,
        }
    }

    /// Minimal exporter pipeline reading from `input_stream`
    pub fn exporter(
        pipeline_id: impl Into<String>,
        input_stream: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            kind: ComponentKind::Exporter,
            image: image.into(),
            version: String::new(),
            protocol: serde_json::Value::Null,
            output_stream: None,
            input_stream: Some(input_stream.into()),
            asset_id: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            validation: ValidationRules::default(),
            limits: ResourceLimits::default(),
            critical: false,
        }
    }

    pub fn with_rule(mut self, parameter: impl Into<String>, rule: ParameterRule) -> Self {
        self.validation.parameters.insert(parameter.into(), rule);
        self
    }

    fn validate(&self) -> Result<()> {
        let id = &self.pipeline_id;
        if self.image.trim().is_empty() {
            return Err(GatewayError::Config(format!("pipeline '{}': image is required", id)));
        }
        if self.poll_interval_ms == 0 {
            return Err(GatewayError::Config(format!(
                "pipeline '{}': poll_interval_ms must be positive",
                id
            )));
        }
        if self.limits.memory_bytes == 0 || self.limits.cpu_millis == 0 {
            return Err(GatewayError::Config(format!(
                "pipeline '{}': resource limits must be non-zero",
                id
            )));
        }
        match self.kind {
            ComponentKind::Collector => {
                let stream = self.output_stream.as_deref().unwrap_or("");
                if stream.is_empty() {
                    return Err(GatewayError::Config(format!(
                        "collector '{}': output_stream is required",
                        id
                    )));
                }
                if topics::is_reserved(stream) {
                    return Err(GatewayError::Config(format!(
                        "collector '{}': output_stream '{}' is reserved",
                        id, stream
                    )));
                }
                if self.asset_id.trim().is_empty() {
                    return Err(GatewayError::Config(format!(
                        "collector '{}': asset_id is required",
                        id
                    )));
                }
            }
            ComponentKind::Exporter => {
                if self.input_stream.as_deref().unwrap_or("").is_empty() {
                    return Err(GatewayError::Config(format!(
                        "exporter '{}': input_stream is required",
                        id
                    )));
                }
            }
        }
        for (param, rule) in &self.validation.parameters {
            if let (Some(min), Some(max)) = (rule.min, rule.max) {
                if min > max {
                    return Err(GatewayError::Config(format!(
                        "pipeline '{}': parameter '{}' has min > max",
                        id, param
                    )));
                }
            }
            if matches!(rule.max_delta, Some(d) if d < 0.0) {
                return Err(GatewayError::Config(format!(
                    "pipeline '{}': parameter '{}' has negative max_delta",
                    id, param
                )));
            }
        }
        Ok(())
    }
}

/// Structural difference between two pipeline sets, keyed by pipeline id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    pub removed: Vec<PipelineConfig>,
    /// `(old, new)` pairs whose definitions differ
    pub changed: Vec<(PipelineConfig, PipelineConfig)>,
    pub added: Vec<PipelineConfig>,
}

impl ConfigDiff {
    pub fn between(old: &[PipelineConfig], new: &[PipelineConfig]) -> Self {
        let mut diff = ConfigDiff::default();
        for o in old {
            match new.iter().find(|n| n.pipeline_id == o.pipeline_id) {
                None => diff.removed.push(o.clone()),
                Some(n) if n != o => diff.changed.push((o.clone(), n.clone())),
                Some(_) => {}
            }
        }
        for n in new {
            if !old.iter().any(|o| o.pipeline_id == n.pipeline_id) {
                diff.added.push(n.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.changed.is_empty() && self.added.is_empty()
    }

    /// Pipeline ids started or restarted by this diff
    pub fn affected_ids(&self) -> Vec<String> {
        self.changed
            .iter()
            .map(|(_, n)| n.pipeline_id.clone())
            .chain(self.added.iter().map(|p| p.pipeline_id.clone()))
            .collect()
    }
}

/// Last confirmed config, persisted locally for offline restarts
///
/// File layout: eight hex digits of CRC-32, a newline, then the JSON body.
#[derive(Debug, Clone)]
pub struct ConfigCache {
    path: PathBuf,
}

impl ConfigCache {
    pub const FILE_NAME: &'static str = "gateway-config.json";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached config. A checksum mismatch is fatal.
    pub fn load(&self) -> Result<Option<GatewayConfig>> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let newline = bytes.iter().position(|b| *b == b'\n').ok_or_else(|| {
            GatewayError::Invariant(format!("{}: missing checksum header", self.path.display()))
        })?;
        let (header, body) = bytes.split_at(newline);
        let body = &body[1..];
        let expected = std::str::from_utf8(header)
            .ok()
            .and_then(|h| u32::from_str_radix(h.trim(), 16).ok())
            .ok_or_else(|| {
                GatewayError::Invariant(format!("{}: malformed checksum", self.path.display()))
            })?;
        let actual = CACHE_CRC.checksum(body);
        if expected != actual {
            return Err(GatewayError::Invariant(format!(
                "{}: checksum mismatch (expected {:08x}, got {:08x})",
                self.path.display(),
                expected,
                actual
            )));
        }

        let config: GatewayConfig = serde_json::from_slice(body).map_err(|e| {
            GatewayError::Invariant(format!("{}: corrupt body: {}", self.path.display(), e))
        })?;
        Ok(Some(config))
    }

    /// Persist `config`, replacing the previous file atomically
    pub fn store(&self, config: &GatewayConfig) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let body = serde_json::to_vec_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            writeln!(file, "{:08x}", CACHE_CRC.checksum(&body))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
