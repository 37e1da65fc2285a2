// Edgeloop Daemon - Collector ingest over HTTP
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Collector ingest.
//!
//! Collectors that cannot reach the log directly POST their readings to
//! `/ingest/{stream}`. Each reading is stamped with the receipt time, framed
//! with the reading schema and appended to the raw stream keyed by asset.
//! Only raw streams of the active config are accepted.

use edgeloop::schema::READING_SUBJECT;
use edgeloop::{Classification, DurableLog, GatewayConfig, GatewayError, Reading, ReadingCodec};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A reading as sent by a collector; the gateway assigns receipt time and quality
#[derive(Debug, Clone, Deserialize)]
pub struct IngestReading {
    pub asset_id: String,
    pub parameter: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub classification: Classification,
    /// RFC 3339 device timestamp
    #[serde(default)]
    pub device_time: Option<String>,
    #[serde(default)]
    pub component_id: String,
}

impl IngestReading {
    fn into_reading(self, received_ms: u64) -> Reading {
        let mut reading = Reading::new(self.asset_id, self.parameter, self.value, received_ms)
            .with_unit(self.unit)
            .with_classification(self.classification)
            .with_component(self.component_id);
        reading.device_time = self.device_time;
        reading
    }
}

/// One reading or a batch
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngestBody {
    Batch(Vec<IngestReading>),
    One(IngestReading),
}

impl IngestBody {
    fn into_readings(self) -> Vec<IngestReading> {
        match self {
            IngestBody::Batch(readings) => readings,
            IngestBody::One(reading) => vec![reading],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReceipt {
    pub stream: String,
    pub accepted: usize,
    pub last_offset: u64,
}

/// Ingest errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Unknown raw stream: {0}")]
    UnknownStream(String),

    #[error("Empty batch")]
    EmptyBatch,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Frame and append readings to a raw stream of the active config
pub async fn ingest(
    log: &dyn DurableLog,
    codec: &ReadingCodec,
    config: &GatewayConfig,
    stream: &str,
    body: IngestBody,
    received_ms: u64,
) -> Result<IngestReceipt, IngestError> {
    if !config.raw_streams().iter().any(|s| s == stream) {
        return Err(IngestError::UnknownStream(stream.to_string()));
    }
    let readings = body.into_readings();
    if readings.is_empty() {
        return Err(IngestError::EmptyBatch);
    }

    // Encode everything first so a bad reading rejects the whole batch
    let mut framed = Vec::with_capacity(readings.len());
    for reading in readings {
        let reading = reading.into_reading(received_ms);
        let payload = codec.encode(READING_SUBJECT, &reading).await?;
        framed.push((reading.asset_id, payload));
    }

    let accepted = framed.len();
    let mut last_offset = 0;
    for (asset_id, payload) in framed {
        last_offset = log.produce(stream, &asset_id, payload).await?;
    }
    debug!(stream, accepted, last_offset, "ingested readings");
    Ok(IngestReceipt {
        stream: stream.to_string(),
        accepted,
        last_offset,
    })
}
