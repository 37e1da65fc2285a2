// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Alert fan-out: tracing plus the `gateway.alerts` topic.

use std::collections::VecDeque;
use std::sync::Arc;

use edgeloop::schema::ALERT_SUBJECT;
use edgeloop::{topics, Alert, AlertSeverity, DurableLog, ReadingCodec};
use parking_lot::Mutex;
use tracing::{error, info, warn};

const RECENT_CAPACITY: usize = 128;

/// Where control-loop units raise alerts
#[derive(Clone)]
pub struct AlertSink {
    target: Option<(Arc<dyn DurableLog>, ReadingCodec)>,
    recent: Arc<Mutex<VecDeque<Alert>>>,
}

impl AlertSink {
    pub fn new(log: Arc<dyn DurableLog>, codec: ReadingCodec) -> Self {
        Self {
            target: Some((log, codec)),
            recent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Sink that only logs and remembers
    pub fn detached() -> Self {
        Self {
            target: None,
            recent: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub async fn raise(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Advisory => {
                info!(source = %alert.source, severity = "advisory", "{}", alert.message)
            }
            AlertSeverity::Warning => {
                warn!(source = %alert.source, severity = "warning", "{}", alert.message)
            }
            AlertSeverity::Critical | AlertSeverity::Page => {
                error!(source = %alert.source, severity = alert.severity.as_str(), "{}", alert.message)
            }
        }
        {
            let mut recent = self.recent.lock();
            recent.push_back(alert.clone());
            while recent.len() > RECENT_CAPACITY {
                recent.pop_front();
            }
        }
        if let Some((log, codec)) = &self.target {
            let produced = match codec.encode(ALERT_SUBJECT, &alert).await {
                Ok(payload) => log.produce(topics::ALERTS, &alert.source, payload).await,
                Err(e) => Err(e),
            };
            if let Err(e) = produced {
                warn!(error = %e, "failed to append alert to log");
            }
        }
    }

    /// Most recent alerts, oldest first
    pub fn recent(&self) -> Vec<Alert> {
        self.recent.lock().iter().cloned().collect()
    }
}
