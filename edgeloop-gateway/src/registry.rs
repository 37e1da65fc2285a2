// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP schema-registry client.

use std::time::Duration;

use async_trait::async_trait;
use edgeloop::schema::{Schema, SchemaRegistry};
use edgeloop::{GatewayError, Result};
use reqwest::Client;
use serde::Deserialize;

/// Registry reply: `{"id": 7, "subject": "...", "schema": {...}}`
#[derive(Debug, Deserialize)]
struct RegistrySchema {
    id: u32,
    #[serde(default)]
    subject: Option<String>,
    schema: serde_json::Value,
}

/// Schema registry spoken to over HTTP/JSON
pub struct HttpSchemaRegistry {
    client: Client,
    base_url: String,
}

impl HttpSchemaRegistry {
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

    async fn get(&self, url: String) -> Result<RegistrySchema> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Schema(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::Schema(format!(
                "{}: status {}",
                url,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::Schema(format!("{}: {}", url, e)))
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn latest(&self, subject: &str) -> Result<Schema> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);
        let reply = self.get(url).await?;
        Ok(Schema {
            id: reply.id,
            subject: reply.subject.unwrap_or_else(|| subject.to_string()),
            definition: reply.schema,
        })
    }

    async fn by_id(&self, id: u32) -> Result<Schema> {
        let url = format!("{}/schemas/ids/{}", self.base_url, id);
        let reply = self.get(url).await?;
        let subject = reply.subject.ok_or_else(|| {
            GatewayError::Schema(format!("registry returned schema {} without a subject", id))
        })?;
        Ok(Schema {
            id: reply.id,
            subject,
            definition: reply.schema,
        })
    }
}
