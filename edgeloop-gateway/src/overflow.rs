// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Overflow governor
//!
//! Storage pressure is mapped onto a strictly ordered tier ladder:
//!
//! | Tier | Usage      | Action                                      | Alert    |
//! |------|------------|---------------------------------------------|----------|
//! | 1    | < 70%      | none                                        |          |
//! | 2    | 70% - 80%  | compress older segments                     | advisory |
//! | 3    | 80% - 90%  | delete raw-resolution data past retention   | warning  |
//! | 4    | 90% - 95%  | evict oldest data by ascending priority     | critical |
//! | 5    | >= 95%     | stop admitting writes                       | page     |
//!
//! Each poll first blocks or reopens admission from the measured tier, then
//! runs the actions of tiers 2 up to the measured tier in order,
//! re-measuring after each one. Critical-priority topics are never evicted.
//! Every eviction and block transition is appended to `gateway.overflow`.

use std::sync::Arc;

use edgeloop::schema::OVERFLOW_SUBJECT;
use edgeloop::{
    topics, Admission, Alert, AlertSeverity, DurableLog, GatewayConfig, OverflowAction,
    OverflowEvent, ReadingCodec, Result, StorageSettings, TopicPriority,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alerts::AlertSink;
use crate::clock::Clock;

const SOURCE: &str = "governor";

/// Rung of the tier ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OverflowTier {
    Normal = 1,
    Compress = 2,
    PurgeRaw = 3,
    Evict = 4,
    Block = 5,
}

impl OverflowTier {
    pub fn for_usage(used_pct: f64, storage: &StorageSettings) -> Self {
        if used_pct >= storage.block_at_pct {
            OverflowTier::Block
        } else if used_pct >= storage.evict_at_pct {
            OverflowTier::Evict
        } else if used_pct >= storage.purge_raw_at_pct {
            OverflowTier::PurgeRaw
        } else if used_pct >= storage.compress_at_pct {
            OverflowTier::Compress
        } else {
            OverflowTier::Normal
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }

    pub fn severity(&self) -> Option<AlertSeverity> {
        match self {
            OverflowTier::Normal => None,
            OverflowTier::Compress => Some(AlertSeverity::Advisory),
            OverflowTier::PurgeRaw => Some(AlertSeverity::Warning),
            OverflowTier::Evict => Some(AlertSeverity::Critical),
            OverflowTier::Block => Some(AlertSeverity::Page),
        }
    }
}

/// Latest governor observation, published after every poll
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GovernorStatus {
    pub tier: u8,
    pub usage_pct: f64,
    pub blocked: bool,
}

impl Default for GovernorStatus {
    fn default() -> Self {
        Self {
            tier: OverflowTier::Normal.level(),
            usage_pct: 0.0,
            blocked: false,
        }
    }
}

/// Storage-pressure governor over the durable log
pub struct OverflowGovernor {
    log: Arc<dyn DurableLog>,
    codec: ReadingCodec,
    alerts: AlertSink,
    config: watch::Receiver<Arc<GatewayConfig>>,
    clock: Clock,
    tier: OverflowTier,
    blocked: bool,
    status_tx: watch::Sender<GovernorStatus>,
}

impl OverflowGovernor {
    pub fn new(
        log: Arc<dyn DurableLog>,
        codec: ReadingCodec,
        alerts: AlertSink,
        config: watch::Receiver<Arc<GatewayConfig>>,
        clock: Clock,
    ) -> Self {
        let (status_tx, _) = watch::channel(GovernorStatus::default());
        Self {
            log,
            codec,
            alerts,
            config,
            clock,
            tier: OverflowTier::Normal,
            blocked: false,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<GovernorStatus> {
        self.status_tx.subscribe()
    }

    pub fn tier(&self) -> OverflowTier {
        self.tier
    }

    async fn usage_pct(&self) -> Result<f64> {
        Ok(self.log.storage_usage().await?.used_pct())
    }

    /// Measure usage and run the ladder once
    pub async fn poll(&mut self) -> Result<GovernorStatus> {
        let config = self.config.borrow().clone();
        let storage = &config.settings.storage;
        let now = self.clock.now_ms();

        let before = self.usage_pct().await?;
        let measured = OverflowTier::for_usage(before, storage);
        self.transition(measured, before, now).await;

        // Admission follows the tier measured at the top of the ladder;
        // mitigation below never lifts a block within the same poll
        if measured == OverflowTier::Block && !self.blocked {
            self.set_blocked(true, before, now).await?;
        } else if measured < OverflowTier::Block && self.blocked {
            self.set_blocked(false, before, now).await?;
        }

        let mut usage = before;
        if measured >= OverflowTier::Compress {
            let freed = self
                .log
                .compress_segments(now.saturating_sub(storage.compress_after_ms))
                .await?;
            usage = self.usage_pct().await?;
            debug!(freed, usage_pct = usage, "compressed older segments");
        }
        if OverflowTier::for_usage(usage, storage) >= OverflowTier::PurgeRaw {
            self.purge_raw(&config, usage, now).await?;
            usage = self.usage_pct().await?;
        }
        if OverflowTier::for_usage(usage, storage) >= OverflowTier::Evict {
            self.evict(&config, usage, now).await?;
            usage = self.usage_pct().await?;
        }

        let status = GovernorStatus {
            tier: measured.level(),
            usage_pct: usage,
            blocked: self.blocked,
        };
        self.status_tx.send_replace(status);
        Ok(status)
    }

    async fn transition(&mut self, measured: OverflowTier, usage_pct: f64, now: u64) {
        if measured == self.tier {
            return;
        }
        if measured > self.tier {
            if let Some(severity) = measured.severity() {
                self.alerts
                    .raise(Alert::new(
                        now,
                        severity,
                        SOURCE,
                        format!(
                            "storage at {:.1}%, overflow tier {} (was {})",
                            usage_pct,
                            measured.level(),
                            self.tier.level()
                        ),
                    ))
                    .await;
            }
        } else {
            info!(
                from = self.tier.level(),
                to = measured.level(),
                usage_pct,
                "storage pressure subsided"
            );
        }
        self.tier = measured;
    }

    async fn set_blocked(&mut self, blocked: bool, usage_pct: f64, now: u64) -> Result<()> {
        let (admission, action, tier) = if blocked {
            (
                Admission::Blocked {
                    exempt: vec![topics::OVERFLOW.to_string(), topics::ALERTS.to_string()],
                },
                OverflowAction::Block,
                OverflowTier::Block,
            )
        } else {
            (Admission::Open, OverflowAction::Unblock, self.tier)
        };
        self.log.set_admission(admission).await?;
        self.blocked = blocked;
        if blocked {
            warn!(usage_pct, "log blocked, only critical topics admitted");
        } else {
            info!(usage_pct, "log admitting writes again");
        }
        self.record(OverflowEvent {
            at_ms: now,
            tier: tier.level(),
            action,
            bytes_freed: 0,
            evicted_range_ms: None,
            affected_topics: Vec::new(),
            usage_before_pct: usage_pct,
            usage_after_pct: usage_pct,
        })
        .await;
        Ok(())
    }

    /// Delete raw-resolution data older than the retention period
    async fn purge_raw(&self, config: &GatewayConfig, usage_before: f64, now: u64) -> Result<()> {
        let cutoff = now.saturating_sub(config.settings.storage.raw_retention_ms);
        let mut event = OverflowEvent {
            at_ms: now,
            tier: OverflowTier::PurgeRaw.level(),
            action: OverflowAction::PurgeRaw,
            bytes_freed: 0,
            evicted_range_ms: None,
            affected_topics: Vec::new(),
            usage_before_pct: usage_before,
            usage_after_pct: usage_before,
        };
        for topic in config.raw_resolution_topics() {
            if config.priority_of(&topic) == TopicPriority::Critical {
                continue;
            }
            let outcome = self.log.delete_older_than(&topic, cutoff).await?;
            if outcome.records > 0 {
                event.bytes_freed += outcome.bytes_freed;
                event.evicted_range_ms = merge_range(event.evicted_range_ms, outcome.range_ms);
                event.affected_topics.push(topic);
            }
        }
        if event.bytes_freed > 0 {
            event.usage_after_pct = self.usage_pct().await?;
            warn!(
                bytes_freed = event.bytes_freed,
                topics = ?event.affected_topics,
                "purged raw data past retention"
            );
            self.record(event).await;
        }
        Ok(())
    }

    /// Evict oldest data, lowest priority first, until usage is below the tier
    async fn evict(&self, config: &GatewayConfig, usage_before: f64, now: u64) -> Result<()> {
        let usage = self.log.storage_usage().await?;
        let mut remaining = usage.bytes_above(config.settings.storage.evict_at_pct);
        let raw = config.raw_resolution_topics();

        let mut candidates: Vec<_> = self
            .log
            .topics()
            .await?
            .into_iter()
            .filter(|t| t.bytes > 0 && !topics::is_always_critical(&t.name))
            .map(|t| (config.priority_of(&t.name), t))
            .filter(|(priority, _)| *priority != TopicPriority::Critical)
            .collect();
        candidates.sort_by_key(|(priority, t)| {
            (*priority, !raw.contains(&t.name), t.oldest_ms.unwrap_or(u64::MAX))
        });

        let mut event = OverflowEvent {
            at_ms: now,
            tier: OverflowTier::Evict.level(),
            action: OverflowAction::Evict,
            bytes_freed: 0,
            evicted_range_ms: None,
            affected_topics: Vec::new(),
            usage_before_pct: usage_before,
            usage_after_pct: usage_before,
        };
        for (priority, topic) in candidates {
            if remaining == 0 {
                break;
            }
            let outcome = self.log.evict_oldest(&topic.name, remaining).await?;
            if outcome.records == 0 {
                continue;
            }
            debug!(
                topic = %topic.name,
                priority = priority.as_str(),
                bytes = outcome.bytes_freed,
                "evicted"
            );
            remaining = remaining.saturating_sub(outcome.bytes_freed);
            event.bytes_freed += outcome.bytes_freed;
            event.evicted_range_ms = merge_range(event.evicted_range_ms, outcome.range_ms);
            event.affected_topics.push(topic.name);
        }

        if event.bytes_freed > 0 {
            event.usage_after_pct = self.usage_pct().await?;
            warn!(
                bytes_freed = event.bytes_freed,
                topics = ?event.affected_topics,
                usage_pct = event.usage_after_pct,
                "evicted data under storage pressure"
            );
            self.record(event).await;
        }
        Ok(())
    }

    async fn record(&self, event: OverflowEvent) {
        let produced = match self.codec.encode(OVERFLOW_SUBJECT, &event).await {
            Ok(payload) => self.log.produce(topics::OVERFLOW, SOURCE, payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = produced {
            warn!(error = %e, action = ?event.action, "failed to append overflow event");
        }
    }

    /// Poll on the governor interval until shutdown
    pub async fn run(mut self, period: std::time::Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = shutdown.recv() => match result {
                    Ok(()) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => continue,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!(error = %e, "overflow poll failed");
                    }
                }
            }
        }
        debug!("overflow governor stopped");
    }
}

fn merge_range(a: Option<(u64, u64)>, b: Option<(u64, u64)>) -> Option<(u64, u64)> {
    match (a, b) {
        (Some((a0, a1)), Some((b0, b1))) => Some((a0.min(b0), a1.max(b1))),
        (x, None) | (None, x) => x,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_boundaries() {
        let s = StorageSettings::default();
        assert_eq!(OverflowTier::for_usage(69.9, &s), OverflowTier::Normal);
        assert_eq!(OverflowTier::for_usage(70.0, &s), OverflowTier::Compress);
        assert_eq!(OverflowTier::for_usage(85.0, &s), OverflowTier::PurgeRaw);
        assert_eq!(OverflowTier::for_usage(91.0, &s), OverflowTier::Evict);
        assert_eq!(OverflowTier::for_usage(95.0, &s), OverflowTier::Block);
        assert_eq!(OverflowTier::Block.level(), 5);
        assert_eq!(OverflowTier::Evict.severity(), Some(AlertSeverity::Critical));
    }

    #[test]
    fn test_merge_range() {
        assert_eq!(merge_range(None, Some((5, 9))), Some((5, 9)));
        assert_eq!(merge_range(Some((3, 4)), Some((5, 9))), Some((3, 9)));
        assert_eq!(merge_range(None, None), None);
    }
}
