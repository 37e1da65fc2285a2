// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Durable log port
//!
//! The gateway depends on an external append-only, partitioned log with
//! at-least-once produce, offset-based replay and a storage-usage query.
//! [`DurableLog`] is the narrow interface the control loop uses;
//! [`MemoryLog`] is an in-process implementation for standalone runs and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// A record read back from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub offset: u64,
    /// Partition key (asset id)
    pub key: String,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Local storage consumption
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub capacity_bytes: u64,
}

impl StorageUsage {
    pub fn used_pct(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 100.0;
        }
        self.used_bytes as f64 * 100.0 / self.capacity_bytes as f64
    }

    /// Bytes to free to bring usage strictly below `target_pct`
    pub fn bytes_above(&self, target_pct: f64) -> u64 {
        let target = (self.capacity_bytes as f64 * target_pct / 100.0).floor() as u64;
        if self.used_bytes < target {
            0
        } else {
            self.used_bytes - target + 1
        }
    }
}

/// Result of a deletion or eviction on one topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionOutcome {
    pub records: u64,
    pub bytes_freed: u64,
    /// Oldest and newest timestamp among removed records
    pub range_ms: Option<(u64, u64)>,
}

impl EvictionOutcome {
    fn absorb(&mut self, ts: u64, bytes: u64) {
        self.records += 1;
        self.bytes_freed += bytes;
        self.range_ms = Some(match self.range_ms {
            None => (ts, ts),
            Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
        });
    }
}

/// Write admission of the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Admission {
    #[default]
    Open,
    /// Only the listed topics are still admitted
    Blocked { exempt: Vec<String> },
}

/// Per-topic storage summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub bytes: u64,
    pub records: u64,
    pub oldest_ms: Option<u64>,
}

/// The durable log as seen by the control loop
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Append a record; acknowledged only once durable
    async fn produce(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<u64>;

    /// Read up to `max` records starting at `offset`
    async fn fetch(&self, topic: &str, offset: u64, max: usize) -> Result<Vec<Record>>;

    /// Committed offset of a consumer group, i.e. the next offset to read
    async fn committed(&self, topic: &str, group: &str) -> Result<Option<u64>>;

    async fn commit(&self, topic: &str, group: &str, next_offset: u64) -> Result<()>;

    async fn storage_usage(&self) -> Result<StorageUsage>;

    async fn topics(&self) -> Result<Vec<TopicInfo>>;

    /// Compress segments older than the cutoff; returns bytes reclaimed
    async fn compress_segments(&self, older_than_ms: u64) -> Result<u64>;

    /// Delete records of `topic` older than the cutoff
    async fn delete_older_than(&self, topic: &str, cutoff_ms: u64) -> Result<EvictionOutcome>;

    /// Delete the oldest records of `topic` until at least `bytes` are freed
    async fn evict_oldest(&self, topic: &str, bytes: u64) -> Result<EvictionOutcome>;

    async fn set_admission(&self, admission: Admission) -> Result<()>;
}

#[derive(Debug)]
struct StoredRecord {
    offset: u64,
    key: String,
    payload: Vec<u8>,
    timestamp_ms: u64,
    compressed: bool,
}

impl StoredRecord {
    fn size(&self) -> u64 {
        let raw = (self.key.len() + self.payload.len()) as u64;
        if self.compressed {
            raw.div_ceil(2)
        } else {
            raw
        }
    }
}

#[derive(Debug, Default)]
struct TopicLog {
    records: VecDeque<StoredRecord>,
    next_offset: u64,
}

impl TopicLog {
    fn bytes(&self) -> u64 {
        self.records.iter().map(StoredRecord::size).sum()
    }
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    topics: BTreeMap<String, TopicLog>,
    groups: HashMap<(String, String), u64>,
    admission: Admission,
    capacity_bytes: u64,
    /// Bytes used on the volume by anything other than the log
    external_bytes: u64,
}

/// In-process log with the same contract as the external service
#[derive(Debug, Default)]
pub struct MemoryLog {
    inner: Mutex<MemoryLogInner>,
}

impl MemoryLog {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(MemoryLogInner {
                capacity_bytes,
                ..Default::default()
            }),
        }
    }

    /// Append with an explicit timestamp
    pub fn produce_at(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        timestamp_ms: u64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Admission::Blocked { exempt } = &inner.admission {
            if !exempt.iter().any(|t| t == topic) {
                return Err(GatewayError::StorageExhaustion(format!(
                    "log is not admitting writes to '{}'",
                    topic
                )));
            }
        }
        let log = inner.topics.entry(topic.to_string()).or_default();
        let offset = log.next_offset;
        log.next_offset += 1;
        log.records.push_back(StoredRecord {
            offset,
            key: key.to_string(),
            payload,
            timestamp_ms,
            compressed: false,
        });
        Ok(offset)
    }

    /// Simulate volume usage by data outside the log
    pub fn set_external_usage(&self, bytes: u64) {
        self.inner.lock().external_bytes = bytes;
    }

    pub fn admission(&self) -> Admission {
        self.inner.lock().admission.clone()
    }

    /// Number of retained records in a topic
    pub fn len(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|t| t.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// All retained payloads of a topic, oldest first
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .topics
            .get(topic)
            .map(|t| t.records.iter().map(|r| r.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn produce(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<u64> {
        self.produce_at(topic, key, payload, crate::now_ms())
    }

    async fn fetch(&self, topic: &str, offset: u64, max: usize) -> Result<Vec<Record>> {
        let inner = self.inner.lock();
        let Some(log) = inner.topics.get(topic) else {
            return Ok(Vec::new());
        };
        Ok(log
            .records
            .iter()
            .filter(|r| r.offset >= offset)
            .take(max)
            .map(|r| Record {
                topic: topic.to_string(),
                offset: r.offset,
                key: r.key.clone(),
                payload: r.payload.clone(),
                timestamp_ms: r.timestamp_ms,
            })
            .collect())
    }

    async fn committed(&self, topic: &str, group: &str) -> Result<Option<u64>> {
        Ok(self
            .inner
            .lock()
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .copied())
    }

    async fn commit(&self, topic: &str, group: &str, next_offset: u64) -> Result<()> {
        self.inner
            .lock()
            .groups
            .insert((topic.to_string(), group.to_string()), next_offset);
        Ok(())
    }

    async fn storage_usage(&self) -> Result<StorageUsage> {
        let inner = self.inner.lock();
        let log_bytes: u64 = inner.topics.values().map(TopicLog::bytes).sum();
        Ok(StorageUsage {
            used_bytes: log_bytes + inner.external_bytes,
            capacity_bytes: inner.capacity_bytes,
        })
    }

    async fn topics(&self) -> Result<Vec<TopicInfo>> {
        let inner = self.inner.lock();
        Ok(inner
            .topics
            .iter()
            .map(|(name, log)| TopicInfo {
                name: name.clone(),
                bytes: log.bytes(),
                records: log.records.len() as u64,
                oldest_ms: log.records.front().map(|r| r.timestamp_ms),
            })
            .collect())
    }

    async fn compress_segments(&self, older_than_ms: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        for log in inner.topics.values_mut() {
            for r in log
                .records
                .iter_mut()
                .filter(|r| !r.compressed && r.timestamp_ms < older_than_ms)
            {
                let before = r.size();
                r.compressed = true;
                freed += before - r.size();
            }
        }
        Ok(freed)
    }

    async fn delete_older_than(&self, topic: &str, cutoff_ms: u64) -> Result<EvictionOutcome> {
        let mut inner = self.inner.lock();
        let mut outcome = EvictionOutcome::default();
        if let Some(log) = inner.topics.get_mut(topic) {
            log.records.retain(|r| {
                if r.timestamp_ms < cutoff_ms {
                    outcome.absorb(r.timestamp_ms, r.size());
                    false
                } else {
                    true
                }
            });
        }
        Ok(outcome)
    }

    async fn evict_oldest(&self, topic: &str, bytes: u64) -> Result<EvictionOutcome> {
        let mut inner = self.inner.lock();
        let mut outcome = EvictionOutcome::default();
        if let Some(log) = inner.topics.get_mut(topic) {
            while outcome.bytes_freed < bytes {
                let Some(r) = log.records.pop_front() else {
                    break;
                };
                outcome.absorb(r.timestamp_ms, r.size());
            }
        }
        Ok(outcome)
    }

    async fn set_admission(&self, admission: Admission) -> Result<()> {
        self.inner.lock().admission = admission;
        Ok(())
    }
}
