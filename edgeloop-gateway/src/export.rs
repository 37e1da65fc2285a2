// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Circuit-guarded export
//!
//! An [`ExportPump`] moves records from one log topic to an external
//! [`Destination`] under a consumer group. Offsets are committed only after a
//! successful write, so whatever is skipped while the circuit is open, or
//! lost by a failed write, stays in the log and is retried later.
//!
//! Records that do not carry a decodable frame can never be delivered. They
//! are left out of the batch, alerted on once and committed past with the
//! rest of it. Only transport failures count against the circuit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeloop::schema::unframe;
use edgeloop::{
    Alert, AlertSeverity, CircuitBreaker, CircuitConfig, CircuitStatus, DurableLog, GatewayError,
    Record, Result,
};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::clock::Clock;

const SOURCE: &str = "export";

/// External sink for exported records
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// Write a batch; the whole batch counts as one attempt
    async fn write(&self, records: &[Record]) -> Result<()>;
}

/// Result of one pump step
#[derive(Debug, Clone, PartialEq)]
pub enum PumpOutcome {
    /// Nothing new in the topic
    Idle,
    /// Circuit open, no call attempted
    Skipped { retry_after_ms: u64 },
    /// Batch written and committed
    Written { records: usize, next_offset: u64 },
    /// Batch held only undecodable records; committed without a write
    Dropped { records: usize, next_offset: u64 },
    /// Write failed; offset left where it was
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PumpStats {
    pub written: u64,
    pub failed_writes: u64,
    pub skipped: u64,
    /// Undecodable records committed past without delivery
    pub dropped: u64,
}

/// Latest pump observation, published after every step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpStatus {
    pub destination: String,
    pub topic: String,
    pub circuit: CircuitStatus,
    pub stats: PumpStats,
}

/// Whether a record carries a frame a destination can decode
pub fn exportable(record: &Record) -> bool {
    unframe(&record.payload)
        .and_then(|(_, body)| Ok(serde_json::from_slice::<serde_json::Value>(body)?))
        .is_ok()
}

/// Failures of the destination itself, as opposed to bad input
fn is_transport_failure(error: &GatewayError) -> bool {
    matches!(
        error,
        GatewayError::Connection { .. } | GatewayError::Io(_) | GatewayError::CircuitOpen { .. }
    )
}

/// Moves one topic to one destination
pub struct ExportPump {
    log: Arc<dyn DurableLog>,
    topic: String,
    group: String,
    destination: Arc<dyn Destination>,
    breaker: CircuitBreaker,
    batch: usize,
    stats: PumpStats,
    alerts: AlertSink,
    /// Undecodable records below this offset were already alerted on
    alerted_through: u64,
    status_tx: watch::Sender<PumpStatus>,
}

impl ExportPump {
    pub fn new(
        log: Arc<dyn DurableLog>,
        topic: impl Into<String>,
        destination: Arc<dyn Destination>,
        circuit: CircuitConfig,
    ) -> Self {
        let topic = topic.into();
        let breaker = CircuitBreaker::with_config(circuit);
        let (status_tx, _) = watch::channel(PumpStatus {
            destination: destination.name().to_string(),
            topic: topic.clone(),
            circuit: breaker.status(),
            stats: PumpStats::default(),
        });
        Self {
            group: format!("export.{}", destination.name()),
            log,
            topic,
            destination,
            breaker,
            batch: 500,
            stats: PumpStats::default(),
            alerts: AlertSink::detached(),
            alerted_through: 0,
            status_tx,
        }
    }

    pub fn with_alerts(mut self, alerts: AlertSink) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn circuit(&self) -> CircuitStatus {
        self.breaker.status()
    }

    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    pub fn subscribe(&self) -> watch::Receiver<PumpStatus> {
        self.status_tx.subscribe()
    }

    pub async fn pump_once(&mut self, now_ms: u64) -> Result<PumpOutcome> {
        let outcome = self.step(now_ms).await;
        let (circuit, stats) = (self.breaker.status(), self.stats);
        self.status_tx.send_modify(|status| {
            status.circuit = circuit;
            status.stats = stats;
        });
        outcome
    }

    async fn step(&mut self, now_ms: u64) -> Result<PumpOutcome> {
        let position = self
            .log
            .committed(&self.topic, &self.group)
            .await?
            .unwrap_or(0);
        let fetched = self.log.fetch(&self.topic, position, self.batch).await?;
        let Some(last) = fetched.last() else {
            return Ok(PumpOutcome::Idle);
        };
        let next_offset = last.offset + 1;

        let (records, undecodable): (Vec<Record>, Vec<Record>) =
            fetched.into_iter().partition(exportable);
        self.alert_undecodable(&undecodable, now_ms).await;

        if records.is_empty() {
            self.log.commit(&self.topic, &self.group, next_offset).await?;
            self.stats.dropped += undecodable.len() as u64;
            return Ok(PumpOutcome::Dropped {
                records: undecodable.len(),
                next_offset,
            });
        }

        if !self.breaker.try_acquire(now_ms) {
            self.stats.skipped += 1;
            return Ok(PumpOutcome::Skipped {
                retry_after_ms: self.breaker.retry_after_ms(now_ms),
            });
        }

        match self.destination.write(&records).await {
            Ok(()) => {
                self.breaker.record_success();
                self.log.commit(&self.topic, &self.group, next_offset).await?;
                self.stats.written += records.len() as u64;
                self.stats.dropped += undecodable.len() as u64;
                debug!(
                    destination = %self.destination.name(),
                    records = records.len(),
                    next_offset,
                    "exported"
                );
                Ok(PumpOutcome::Written {
                    records: records.len(),
                    next_offset,
                })
            }
            Err(e) => {
                if is_transport_failure(&e) {
                    self.breaker.record_failure(now_ms);
                } else {
                    // The destination answered; it is the batch that failed
                    self.breaker.record_success();
                }
                self.stats.failed_writes += 1;
                warn!(
                    destination = %self.destination.name(),
                    error = %e,
                    circuit = self.breaker.state().as_str(),
                    "export write failed"
                );
                Ok(PumpOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn alert_undecodable(&mut self, undecodable: &[Record], now_ms: u64) {
        let fresh: Vec<u64> = undecodable
            .iter()
            .map(|r| r.offset)
            .filter(|offset| *offset >= self.alerted_through)
            .collect();
        let (Some(first), Some(last)) = (fresh.first(), fresh.last()) else {
            return;
        };
        self.alerted_through = last + 1;
        self.alerts
            .raise(Alert::new(
                now_ms,
                AlertSeverity::Warning,
                SOURCE,
                format!(
                    "{} undecodable record(s) in {} at offsets {}..={} not exported to {}",
                    fresh.len(),
                    self.topic,
                    first,
                    last,
                    self.destination.name()
                ),
            ))
            .await;
    }

    /// Pump until shutdown, draining eagerly while data is flowing
    pub async fn run(mut self, clock: Clock, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(topic = %self.topic, destination = %self.destination.name(), "export pump started");
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
                        match self.pump_once(clock.now_ms()).await {
                            Ok(PumpOutcome::Written { .. } | PumpOutcome::Dropped { .. }) => continue,
                            Ok(_) => break,
                            Err(e) => {
                                warn!(topic = %self.topic, error = %e, "export pump error");
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(topic = %self.topic, "export pump stopped");
    }
}

#[derive(Serialize)]
struct ExportedRecord<'a> {
    topic: &'a str,
    offset: u64,
    key: &'a str,
    timestamp_ms: u64,
    schema_id: u32,
    value: serde_json::Value,
}

/// Destination accepting JSON batches over HTTP POST
pub struct HttpDestination {
    name: String,
    url: String,
    client: Client,
}

impl HttpDestination {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }

    fn body<'a>(records: &'a [Record]) -> Result<Vec<ExportedRecord<'a>>> {
        records
            .iter()
            .map(|r| {
                let (schema_id, body) = unframe(&r.payload)?;
                Ok(ExportedRecord {
                    topic: &r.topic,
                    offset: r.offset,
                    key: &r.key,
                    timestamp_ms: r.timestamp_ms,
                    schema_id,
                    value: serde_json::from_slice(body)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Destination for HttpDestination {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, records: &[Record]) -> Result<()> {
        let body = Self::body(records)?;
        let connection = |reason: String| GatewayError::Connection {
            target: self.url.clone(),
            reason,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| connection(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(connection(format!("status {}", response.status())))
        }
    }
}
