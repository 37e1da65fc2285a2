// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Control-plane port
//!
//! The control plane is unreliable by assumption. Every call goes through a
//! [`GuardedControlPlane`], which applies the same circuit-breaker discipline
//! as exporter connections: after repeated failures calls are refused locally
//! with [`GatewayError::CircuitOpen`] until the cool-down passes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgeloop::{
    CircuitBreaker, CircuitConfig, CircuitStatus, GatewayConfig, GatewayError, HealthRollup,
    Result,
};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;

/// Outcome of one reconciliation attempt, reported upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub attempted_version: u64,
    /// `applied`, `rolled_back` or `rejected`
    pub outcome: String,
    pub detail: String,
}

/// Body of `POST /gateways/{id}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub gateway_id: String,
    pub at_ms: u64,
    pub active_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthRollup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconcileReport>,
}

/// Source of gateway configuration and sink of status reports
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Latest config for this gateway, `None` if none is assigned yet
    async fn fetch_config(&self, gateway_id: &str) -> Result<Option<GatewayConfig>>;

    async fn post_status(&self, gateway_id: &str, report: &StatusReport) -> Result<()>;
}

/// Control plane wrapped in a circuit breaker
pub struct GuardedControlPlane {
    inner: Arc<dyn ControlPlane>,
    breaker: Mutex<CircuitBreaker>,
    clock: Clock,
}

impl GuardedControlPlane {
    pub fn new(inner: Arc<dyn ControlPlane>, circuit: CircuitConfig, clock: Clock) -> Self {
        Self {
            inner,
            breaker: Mutex::new(CircuitBreaker::with_config(circuit)),
            clock,
        }
    }

    pub fn circuit(&self) -> CircuitStatus {
        self.breaker.lock().status()
    }

    fn acquire(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let mut breaker = self.breaker.lock();
        if breaker.try_acquire(now) {
            Ok(())
        } else {
            Err(GatewayError::CircuitOpen {
                target: "control-plane".to_string(),
                retry_after_ms: breaker.retry_after_ms(now),
            })
        }
    }

    fn record<T>(&self, result: &Result<T>) {
        let mut breaker = self.breaker.lock();
        match result {
            Ok(_) => breaker.record_success(),
            Err(e) => {
                debug!(error = %e, "control plane call failed");
                breaker.record_failure(self.clock.now_ms());
            }
        }
    }
}

#[async_trait]
impl ControlPlane for GuardedControlPlane {
    async fn fetch_config(&self, gateway_id: &str) -> Result<Option<GatewayConfig>> {
        self.acquire()?;
        let result = self.inner.fetch_config(gateway_id).await;
        self.record(&result);
        result
    }

    async fn post_status(&self, gateway_id: &str, report: &StatusReport) -> Result<()> {
        self.acquire()?;
        let result = self.inner.post_status(gateway_id, report).await;
        self.record(&result);
        result
    }
}

/// HTTP/JSON control-plane client
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, gateway_id: &str, leaf: &str) -> String {
        format!("{}/gateways/{}/{}", self.base_url, gateway_id, leaf)
    }

    fn unreachable(&self, e: impl std::fmt::Display) -> GatewayError {
        GatewayError::ControlPlaneUnreachable(format!("{}: {}", self.base_url, e))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_config(&self, gateway_id: &str) -> Result<Option<GatewayConfig>> {
        let response = self
            .client
            .get(self.url(gateway_id, "config"))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let text = response.text().await.map_err(|e| self.unreachable(e))?;
                GatewayConfig::from_json(&text).map(Some)
            }
            status => Err(self.unreachable(format!("status {}", status))),
        }
    }

    async fn post_status(&self, gateway_id: &str, report: &StatusReport) -> Result<()> {
        let response = self
            .client
            .post(self.url(gateway_id, "status"))
            .json(report)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.unreachable(format!("status {}", response.status())))
        }
    }
}

/// Config read from a local file, for gateways without a control plane
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ControlPlane for FileConfigSource {
    async fn fetch_config(&self, _gateway_id: &str) -> Result<Option<GatewayConfig>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => GatewayConfig::from_json(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::ControlPlaneUnreachable(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn post_status(&self, gateway_id: &str, report: &StatusReport) -> Result<()> {
        if let Some(reconciliation) = &report.reconciliation {
            warn!(
                gateway = %gateway_id,
                version = reconciliation.attempted_version,
                outcome = %reconciliation.outcome,
                "{}",
                reconciliation.detail
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Down {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ControlPlane for Down {
        async fn fetch_config(&self, _gateway_id: &str) -> Result<Option<GatewayConfig>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::ControlPlaneUnreachable("down".into()))
        }

        async fn post_status(&self, _gateway_id: &str, _report: &StatusReport) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_opens_after_failures() {
        let down = Arc::new(Down {
            calls: AtomicU32::new(0),
        });
        let guarded = GuardedControlPlane::new(
            down.clone(),
            CircuitConfig::default(),
            Clock::starting_at(0),
        );
        for _ in 0..5 {
            assert!(matches!(
                guarded.fetch_config("gw").await,
                Err(GatewayError::ControlPlaneUnreachable(_))
            ));
        }
        assert!(matches!(
            guarded.fetch_config("gw").await,
            Err(GatewayError::CircuitOpen { .. })
        ));
        assert_eq!(down.calls.load(Ordering::SeqCst), 5);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let _ = guarded.fetch_config("gw").await;
        assert_eq!(down.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        let source = FileConfigSource::new(&path);
        assert!(source.fetch_config("gw").await.unwrap().is_none());

        std::fs::write(&path, r#"{"gateway_id":"gw","version":3}"#).unwrap();
        let config = source.fetch_config("gw").await.unwrap().unwrap();
        assert_eq!(config.version, 3);

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            source.fetch_config("gw").await,
            Err(GatewayError::Config(_))
        ));
    }
}
