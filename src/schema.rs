// Edgeloop - Edge gateway control loop
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Schema resolution and payload framing
//!
//! Every payload written to the log starts with a magic byte and the schema
//! id it was written with:
//!
//! ```text
//! ┌──────┬───────────────┬──────────────────┐
//! │ 0x00 │ schema id u32 │ JSON body        │
//! │      │ (big-endian)  │                  │
//! └──────┴───────────────┴──────────────────┘
//! ```
//!
//! Resolved schemas are cached in memory and in a JSON file. When the
//! registry is unreachable the gateway keeps going on the cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

/// Leading byte of every framed payload
pub const MAGIC_BYTE: u8 = 0x00;

/// Frame header size: magic byte + schema id
pub const HEADER_SIZE: usize = 5;

pub const READING_SUBJECT: &str = "edgeloop.reading";
pub const DEAD_LETTER_SUBJECT: &str = "edgeloop.deadletter";
pub const DECISION_SUBJECT: &str = "edgeloop.deadletter.decision";
pub const AGGREGATE_SUBJECT: &str = "edgeloop.aggregate";
pub const OVERFLOW_SUBJECT: &str = "edgeloop.overflow";
pub const ALERT_SUBJECT: &str = "edgeloop.alert";
pub const HEALTH_SUBJECT: &str = "edgeloop.health";

/// A schema known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub id: u32,
    pub subject: String,
    pub definition: serde_json::Value,
}

/// External schema registry
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Latest schema registered under a subject
    async fn latest(&self, subject: &str) -> Result<Schema>;

    /// Schema by id
    async fn by_id(&self, id: u32) -> Result<Schema>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheContents {
    by_id: BTreeMap<u32, Schema>,
    latest: BTreeMap<String, u32>,
}

/// Registry-backed schema cache with file persistence
pub struct SchemaCache {
    registry: Option<Arc<dyn SchemaRegistry>>,
    path: Option<PathBuf>,
    contents: RwLock<CacheContents>,
}

impl SchemaCache {
    /// Cache without a registry, for standalone runs
    pub fn offline() -> Self {
        Self {
            registry: None,
            path: None,
            contents: RwLock::new(CacheContents::default()),
        }
    }

    pub fn with_registry(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self {
            registry: Some(registry),
            ..Self::offline()
        }
    }

    /// Persist resolved schemas to `path`, loading whatever is already there
    pub fn persisted_at(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let contents: CacheContents = serde_json::from_str(&text).map_err(|e| {
                GatewayError::Invariant(format!(
                    "schema cache {} is corrupted: {}",
                    path.display(),
                    e
                ))
            })?;
            *self.contents.write() = contents;
        }
        self.path = Some(path);
        Ok(self)
    }

    /// Cache preloaded with [`builtin_schemas`]
    pub fn with_builtins(self) -> Result<Self> {
        for schema in builtin_schemas() {
            self.insert(schema)?;
        }
        Ok(self)
    }

    /// Register a schema locally without the registry
    pub fn insert(&self, schema: Schema) -> Result<()> {
        {
            let mut contents = self.contents.write();
            contents.latest.insert(schema.subject.clone(), schema.id);
            contents.by_id.insert(schema.id, schema);
        }
        self.persist()
    }

    /// Schema for a subject: the cached one, else the registry's latest
    pub async fn resolve_latest(&self, subject: &str) -> Result<Schema> {
        if let Some(schema) = self.cached_latest(subject) {
            return Ok(schema);
        }
        self.refresh(subject).await
    }

    /// Ask the registry for the latest schema of a subject
    ///
    /// Falls back to the cached schema when the registry is unreachable.
    pub async fn refresh(&self, subject: &str) -> Result<Schema> {
        if let Some(registry) = &self.registry {
            match registry.latest(subject).await {
                Ok(schema) => {
                    self.insert(schema.clone())?;
                    return Ok(schema);
                }
                Err(e) => {
                    warn!(subject, error = %e, "schema registry unreachable, using cache");
                }
            }
        }
        self.cached_latest(subject)
            .ok_or_else(|| GatewayError::Schema(format!("no schema cached for '{}'", subject)))
    }

    fn cached_latest(&self, subject: &str) -> Option<Schema> {
        let contents = self.contents.read();
        contents
            .latest
            .get(subject)
            .and_then(|id| contents.by_id.get(id))
            .cloned()
    }

    /// Resolve a schema by id; ids are immutable so the cache is checked first
    pub async fn resolve_id(&self, id: u32) -> Result<Schema> {
        if let Some(schema) = self.contents.read().by_id.get(&id).cloned() {
            return Ok(schema);
        }
        let Some(registry) = &self.registry else {
            return Err(GatewayError::Schema(format!("unknown schema id {}", id)));
        };
        let schema = registry.by_id(id).await?;
        debug!(id, subject = %schema.subject, "schema resolved");
        {
            let mut contents = self.contents.write();
            contents.by_id.insert(id, schema.clone());
        }
        self.persist()?;
        Ok(schema)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&*self.contents.read())?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Schemas written by the gateway, with the ids used when no registry is configured
pub fn builtin_schemas() -> Vec<Schema> {
    [
        READING_SUBJECT,
        DEAD_LETTER_SUBJECT,
        DECISION_SUBJECT,
        AGGREGATE_SUBJECT,
        OVERFLOW_SUBJECT,
        ALERT_SUBJECT,
        HEALTH_SUBJECT,
    ]
    .iter()
    .zip(1u32..)
    .map(|(subject, id)| Schema {
        id,
        subject: subject.to_string(),
        definition: serde_json::json!({ "type": "json", "subject": subject }),
    })
    .collect()
}

/// Prefix a JSON body with the frame header
pub fn frame(schema_id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.push(MAGIC_BYTE);
    out.extend_from_slice(&schema_id.to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a framed payload into schema id and body
pub fn unframe(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < HEADER_SIZE {
        return Err(GatewayError::Schema(format!(
            "payload too short: {} bytes",
            payload.len()
        )));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(GatewayError::Schema(format!(
            "bad magic byte 0x{:02x}",
            payload[0]
        )));
    }
    let id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((id, &payload[HEADER_SIZE..]))
}

/// Encodes and decodes framed payloads against the schema cache
#[derive(Clone)]
pub struct ReadingCodec {
    cache: Arc<SchemaCache>,
}

impl ReadingCodec {
    pub fn new(cache: Arc<SchemaCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// Encode with the latest schema of `subject`
    pub async fn encode<T: Serialize>(&self, subject: &str, value: &T) -> Result<Vec<u8>> {
        let schema = self.cache.resolve_latest(subject).await?;
        let body = serde_json::to_vec(value)?;
        Ok(frame(schema.id, &body))
    }

    /// Decode, checking the writer's schema id is resolvable
    pub async fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        let (id, body) = unframe(payload)?;
        self.cache.resolve_id(id).await?;
        Ok(serde_json::from_slice(body)?)
    }
}
