// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Stream workers
//!
//! One logical worker per input stream:
//!
//! - [`ValidatorWorker`]: a raw collector stream into clean, alarm,
//!   dead-letter and event topics
//! - [`AggregatorWorker`]: the clean stream into `rollups.<resolution>`
//! - [`DecisionWorker`]: operator dead-letter decisions back onto the clean
//!   stream
//!
//! Workers keep their read position in memory and commit to their consumer
//! group only once every output derived from the consumed records is in the
//! log. Outputs that could not be appended (for example while the governor
//! blocks writes) are kept and retried before anything new is read.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use edgeloop::schema::{AGGREGATE_SUBJECT, DEAD_LETTER_SUBJECT, READING_SUBJECT};
use edgeloop::{
    topics, AggregateWindow, ComponentKind, DeadLetterDecision, DurableLog, GatewayConfig,
    ReadingCodec, Record, Reading, Result, ValidationRules,
};
use edgeloop_quality::{
    apply_decision, Aggregator, AggregatorConfig, AggregatorStats, Output, QualityValidator,
    ValidatorConfig, ValidatorStats,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;

pub const VALIDATOR_GROUP: &str = "validator";
pub const AGGREGATOR_GROUP: &str = "aggregator";
pub const DECISION_GROUP: &str = "deadletter-decisions";

/// Counters shared by every worker, read by the daemon
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Validator counters per raw stream
    pub validators: BTreeMap<String, ValidatorStats>,
    pub aggregator: AggregatorStats,
    pub approved: u64,
    pub discarded: u64,
    /// Records that could not be decoded and were skipped
    pub undecodable: u64,
}

pub type SharedStats = Arc<RwLock<PipelineStats>>;

/// Encoded record waiting to be appended
#[derive(Debug, Clone)]
struct PendingRecord {
    topic: String,
    key: String,
    payload: Vec<u8>,
}

/// Read position, pending outputs and commit of one consumer
struct Cursor {
    topic: String,
    group: String,
    position: Option<u64>,
    pending: VecDeque<PendingRecord>,
    pending_commit: Option<u64>,
}

impl Cursor {
    fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            position: None,
            pending: VecDeque::new(),
            pending_commit: None,
        }
    }

    async fn next_batch(&mut self, log: &dyn DurableLog, max: usize) -> Result<Vec<Record>> {
        let position = match self.position {
            Some(p) => p,
            None => log.committed(&self.topic, &self.group).await?.unwrap_or(0),
        };
        self.position = Some(position);
        let records = log.fetch(&self.topic, position, max).await?;
        if let Some(last) = records.last() {
            self.position = Some(last.offset + 1);
        }
        Ok(records)
    }

    fn push(&mut self, topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) {
        self.pending.push_back(PendingRecord {
            topic: topic.into(),
            key: key.into(),
            payload,
        });
    }

    /// Append pending outputs in order, then commit
    async fn flush(&mut self, log: &dyn DurableLog) -> Result<()> {
        while let Some(record) = self.pending.front() {
            log.produce(&record.topic, &record.key, record.payload.clone())
                .await?;
            self.pending.pop_front();
        }
        if let Some(next) = self.pending_commit.take() {
            log.commit(&self.topic, &self.group, next).await?;
        }
        Ok(())
    }

    /// Forget the in-memory position so the next batch resumes from the commit
    fn rewind(&mut self) {
        self.position = None;
    }
}

/// Validation rules and polling cadence of the collectors writing `stream`
pub fn rules_for_stream(config: &GatewayConfig, stream: &str) -> (ValidationRules, u64) {
    let writers: Vec<_> = config
        .pipelines
        .iter()
        .filter(|p| p.kind == ComponentKind::Collector && p.output_stream.as_deref() == Some(stream))
        .collect();
    let mut rules = ValidationRules::default();
    let mut poll_interval_ms: Option<u64> = None;
    for pipeline in &writers {
        for (parameter, rule) in &pipeline.validation.parameters {
            rules.insert_for_asset(pipeline.asset_id.clone(), parameter.clone(), *rule);
        }
        poll_interval_ms = Some(
            poll_interval_ms.map_or(pipeline.poll_interval_ms, |p| p.min(pipeline.poll_interval_ms)),
        );
    }
    // A sole writer's rules also cover readings tagged with another asset
    if let [only] = writers.as_slice() {
        rules.parameters = only.validation.parameters.clone();
    }
    (
        rules,
        poll_interval_ms.unwrap_or(ValidatorConfig::default().poll_interval_ms),
    )
}

/// Aggregator settings for a config version
pub fn aggregator_config(config: &GatewayConfig) -> AggregatorConfig {
    AggregatorConfig::default()
        .with_resolutions(config.resolutions())
        .with_late_policy(config.settings.late_policy)
}

/// Validates one raw collector stream
pub struct ValidatorWorker {
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    cursor: Cursor,
    validator: QualityValidator,
    config: watch::Receiver<Arc<GatewayConfig>>,
    stats: SharedStats,
    clock: Clock,
    batch: usize,
}

impl ValidatorWorker {
    pub fn new(
        stream: impl Into<String>,
        log: Arc<dyn DurableLog>,
        codec: ReadingCodec,
        mut config: watch::Receiver<Arc<GatewayConfig>>,
        stats: SharedStats,
        clock: Clock,
    ) -> Self {
        let stream = stream.into();
        let (rules, poll) = rules_for_stream(&config.borrow_and_update(), &stream);
        Self {
            log,
            codec,
            cursor: Cursor::new(stream, VALIDATOR_GROUP),
            validator: QualityValidator::new(rules, ValidatorConfig::default().with_poll_interval(poll)),
            config,
            stats,
            clock,
            batch: 500,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn stream(&self) -> &str {
        &self.cursor.topic
    }

    fn refresh_rules(&mut self) {
        if self.config.has_changed().unwrap_or(false) {
            let config = self.config.borrow_and_update().clone();
            let (rules, poll) = rules_for_stream(&config, &self.cursor.topic);
            debug!(stream = %self.cursor.topic, version = config.version, "validation rules updated");
            self.validator.update_rules(rules, poll);
        }
    }

    async fn queue(&mut self, output: Output) -> Result<()> {
        let (subject, payload) = match &output {
            Output::DeadLetter(entry) => (
                DEAD_LETTER_SUBJECT,
                self.codec.encode(DEAD_LETTER_SUBJECT, entry).await?,
            ),
            Output::Clean(r) | Output::Alarm(r) | Output::Gap(r) => {
                (READING_SUBJECT, self.codec.encode(READING_SUBJECT, r).await?)
            }
        };
        debug!(topic = output.topic(), subject, "output queued");
        self.cursor.push(output.topic(), output.key(), payload);
        Ok(())
    }

    /// Validate up to one batch; returns the number of records consumed
    pub async fn step(&mut self) -> Result<usize> {
        self.refresh_rules();
        self.cursor.flush(self.log.as_ref()).await?;

        let records = self.cursor.next_batch(self.log.as_ref(), self.batch).await?;
        let mut undecodable = 0;
        for record in &records {
            let mut raw: Reading = match self.codec.decode(&record.payload).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(stream = %record.topic, offset = record.offset, error = %e, "undecodable raw record skipped");
                    undecodable += 1;
                    continue;
                }
            };
            if raw.gateway_time_ms == 0 {
                raw.gateway_time_ms = record.timestamp_ms;
            }
            for output in self.validator.validate(&raw).outputs() {
                self.queue(output).await?;
            }
        }
        if let Some(position) = self.cursor.position.filter(|_| !records.is_empty()) {
            self.cursor.pending_commit = Some(position);
        }
        self.publish_stats(undecodable);
        self.cursor.flush(self.log.as_ref()).await?;
        Ok(records.len())
    }

    /// Emit gap events for series silent at `now_ms`
    pub async fn sweep(&mut self, now_ms: u64) -> Result<usize> {
        let gaps = self.validator.sweep_idle(now_ms);
        let n = gaps.len();
        for gap in gaps {
            self.queue(Output::Gap(gap)).await?;
        }
        self.publish_stats(0);
        self.cursor.flush(self.log.as_ref()).await?;
        Ok(n)
    }

    fn publish_stats(&self, undecodable: u64) {
        let mut stats = self.stats.write();
        stats
            .validators
            .insert(self.cursor.topic.clone(), self.validator.stats());
        stats.undecodable += undecodable;
    }

    pub async fn run(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(stream = %self.cursor.topic, "validator worker started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = ticker.tick() => {
                    loop {
                        match self.step().await {
                            Ok(n) if n >= self.batch => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!(stream = %self.cursor.topic, error = %e, "validation step failed");
                                break;
                            }
                        }
                    }
                    if let Err(e) = self.sweep(self.clock.now_ms()).await {
                        warn!(stream = %self.cursor.topic, error = %e, "gap sweep failed");
                    }
                }
            }
        }
        debug!(stream = %self.cursor.topic, "validator worker stopped");
    }
}

/// Aggregates the clean stream
pub struct AggregatorWorker {
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    cursor: Cursor,
    aggregator: Aggregator,
    config: watch::Receiver<Arc<GatewayConfig>>,
    stats: SharedStats,
    clock: Clock,
    batch: usize,
}

impl AggregatorWorker {
    pub fn new(
        log: Arc<dyn DurableLog>,
        codec: ReadingCodec,
        mut config: watch::Receiver<Arc<GatewayConfig>>,
        stats: SharedStats,
        clock: Clock,
    ) -> Self {
        let aggregator = Aggregator::new(aggregator_config(&config.borrow_and_update()));
        Self {
            log,
            codec,
            cursor: Cursor::new(topics::CLEAN, AGGREGATOR_GROUP),
            aggregator,
            config,
            stats,
            clock,
            batch: 500,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Rebuild on resolution or policy changes, replaying from the last commit
    fn refresh_config(&mut self) {
        if !self.config.has_changed().unwrap_or(false) {
            return;
        }
        let config = self.config.borrow_and_update().clone();
        let wanted = aggregator_config(&config);
        let current = self.aggregator.config();
        if wanted.resolutions != current.resolutions || wanted.late_policy != current.late_policy {
            info!(version = config.version, "aggregation settings changed, replaying from commit");
            self.aggregator = Aggregator::new(wanted);
            self.cursor.pending.clear();
            self.cursor.pending_commit = None;
            self.cursor.rewind();
        }
    }

    async fn queue(&mut self, windows: Vec<AggregateWindow>) -> Result<()> {
        for window in windows {
            let payload = self.codec.encode(AGGREGATE_SUBJECT, &window).await?;
            self.cursor
                .push(topics::rollup(&window.resolution), window.asset_id.clone(), payload);
        }
        Ok(())
    }

    fn commit_point(&self) -> Option<u64> {
        let position = self.cursor.position?;
        Some(match self.aggregator.commit_floor() {
            Some(floor) => floor.min(position),
            None => position,
        })
    }

    pub async fn step(&mut self) -> Result<usize> {
        self.refresh_config();
        self.cursor.flush(self.log.as_ref()).await?;

        let records = self.cursor.next_batch(self.log.as_ref(), self.batch).await?;
        let mut undecodable = 0;
        for record in &records {
            let reading: Reading = match self.codec.decode(&record.payload).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "undecodable clean record skipped");
                    undecodable += 1;
                    continue;
                }
            };
            let windows = self.aggregator.ingest(&reading, Some(record.offset));
            self.queue(windows).await?;
        }
        if !records.is_empty() {
            self.cursor.pending_commit = self.commit_point();
        }
        self.publish_stats(undecodable);
        self.cursor.flush(self.log.as_ref()).await?;
        Ok(records.len())
    }

    /// Flush windows that expired by wall clock
    pub async fn flush_expired(&mut self, now_ms: u64) -> Result<usize> {
        let windows = self.aggregator.flush_expired(now_ms);
        let n = windows.len();
        self.queue(windows).await?;
        if n > 0 {
            self.cursor.pending_commit = self.commit_point();
        }
        self.publish_stats(0);
        self.cursor.flush(self.log.as_ref()).await?;
        Ok(n)
    }

    fn publish_stats(&self, undecodable: u64) {
        let mut stats = self.stats.write();
        stats.aggregator = self.aggregator.stats();
        stats.undecodable += undecodable;
    }

    pub async fn run(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!("aggregator worker started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = ticker.tick() => {
                    loop {
                        match self.step().await {
                            Ok(n) if n >= self.batch => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!(error = %e, "aggregation step failed");
                                break;
                            }
                        }
                    }
                    if let Err(e) = self.flush_expired(self.clock.now_ms()).await {
                        warn!(error = %e, "window flush failed");
                    }
                }
            }
        }
        debug!("aggregator worker stopped");
    }
}

/// Re-ingests approved dead-letter entries
pub struct DecisionWorker {
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    cursor: Cursor,
    stats: SharedStats,
    clock: Clock,
    batch: usize,
}

impl DecisionWorker {
    pub fn new(log: Arc<dyn DurableLog>, codec: ReadingCodec, stats: SharedStats, clock: Clock) -> Self {
        Self {
            log,
            codec,
            cursor: Cursor::new(topics::DEAD_LETTER_DECISIONS, DECISION_GROUP),
            stats,
            clock,
            batch: 100,
        }
    }

    pub async fn step(&mut self) -> Result<usize> {
        self.cursor.flush(self.log.as_ref()).await?;
        let records = self.cursor.next_batch(self.log.as_ref(), self.batch).await?;
        let (mut approved, mut discarded, mut undecodable) = (0, 0, 0);
        for record in &records {
            let decision: DeadLetterDecision = match self.codec.decode(&record.payload).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(offset = record.offset, error = %e, "undecodable decision skipped");
                    undecodable += 1;
                    continue;
                }
            };
            match apply_decision(&decision, self.clock.now_ms()) {
                Some(reading) => {
                    let payload = self.codec.encode(READING_SUBJECT, &reading).await?;
                    self.cursor.push(topics::CLEAN, reading.asset_id.clone(), payload);
                    approved += 1;
                }
                None => discarded += 1,
            }
        }
        if let Some(position) = self.cursor.position.filter(|_| !records.is_empty()) {
            self.cursor.pending_commit = Some(position);
        }
        {
            let mut stats = self.stats.write();
            stats.approved += approved;
            stats.discarded += discarded;
            stats.undecodable += undecodable;
        }
        self.cursor.flush(self.log.as_ref()).await?;
        Ok(records.len())
    }

    pub async fn run(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = ticker.tick() => {
                    loop {
                        match self.step().await {
                            Ok(n) if n >= self.batch => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!(error = %e, "decision step failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!("decision worker stopped");
    }
}
