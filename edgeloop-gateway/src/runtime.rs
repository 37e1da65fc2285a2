// Edgeloop Gateway - Control loop orchestration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Container runtime port
//!
//! Collectors and exporters are opaque, independently packaged components.
//! The supervisor only sees the uniform contract: start with a structured
//! config and resource ceilings, stop with a grace period, inspect exit
//! state, and probe the component's health endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use edgeloop::{CircuitState, CircuitStatus, GatewayError, PipelineConfig, ResourceLimits, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Prefix of every container name started by the gateway
pub const CONTAINER_PREFIX: &str = "sf-adapter-";

/// Label value marking containers owned by the gateway
pub const APP_LABEL: &str = "edgeloop";

/// What to start
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Spec for a pipeline: its config as `ADAPTER_CONFIG_JSON`, labels for discovery
    pub fn for_pipeline(pipeline: &PipelineConfig) -> Result<Self> {
        let mut env = BTreeMap::new();
        env.insert(
            "ADAPTER_CONFIG_JSON".to_string(),
            serde_json::to_string(pipeline)?,
        );
        env.insert("PIPELINE_ID".to_string(), pipeline.pipeline_id.clone());
        env.insert("ASSET_ID".to_string(), pipeline.asset_id.clone());
        if let Some(stream) = &pipeline.output_stream {
            env.insert("OUTPUT_STREAM".to_string(), stream.clone());
        }
        if let Some(stream) = &pipeline.input_stream {
            env.insert("INPUT_STREAM".to_string(), stream.clone());
        }

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), APP_LABEL.to_string());
        labels.insert("component".to_string(), pipeline.kind.as_str().to_string());
        labels.insert("pipeline_id".to_string(), pipeline.pipeline_id.clone());

        Ok(Self {
            name: format!("{}{}", CONTAINER_PREFIX, pipeline.pipeline_id),
            image: pipeline.image.clone(),
            env,
            labels,
            limits: pipeline.limits,
        })
    }
}

/// Handle to a started instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceHandle {
    /// Runtime-assigned id
    pub id: String,
    pub name: String,
}

/// Process state as seen by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    Exited { code: i32, oom_killed: bool },
    Missing,
}

/// Readiness reported by a component's health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Still initialising
    #[default]
    Starting,
    Ready,
}

/// One answered health probe
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentProbe {
    pub readiness: Readiness,
    /// Breaker guarding the component's external connection
    #[serde(default)]
    pub circuit: CircuitStatus,
    /// Resident memory, if the runtime reports it
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

impl ComponentProbe {
    pub fn ready() -> Self {
        Self {
            readiness: Readiness::Ready,
            ..Default::default()
        }
    }

    pub fn circuit_open(&self) -> bool {
        self.circuit.state == CircuitState::Open
    }
}

/// The container/process runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, spec: &ContainerSpec) -> Result<InstanceHandle>;

    /// Stop with a grace period, then force
    async fn stop(&self, handle: &InstanceHandle, grace: Duration) -> Result<()>;

    async fn inspect(&self, handle: &InstanceHandle) -> Result<RuntimeState>;

    /// Query the component's health endpoint
    async fn probe(&self, handle: &InstanceHandle) -> Result<ComponentProbe>;
}

/// Docker CLI runtime settings
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// `docker` binary
    pub binary: String,
    /// Network shared by the gateway and its components
    pub network: Option<String>,
    /// Port of the component health endpoint inside the network
    pub health_port: u16,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            network: None,
            health_port: 8080,
        }
    }
}

/// Runs components as Docker containers through the `docker` CLI
pub struct DockerCliRuntime {
    config: DockerConfig,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    circuit: Option<CircuitStatus>,
}

impl DockerCliRuntime {
    pub fn new(config: DockerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Runtime(format!("http client: {}", e)))?;
        Ok(Self { config, http })
    }

    /// `docker run` arguments for a spec
    pub fn run_args(&self, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--restart".to_string(),
            "no".to_string(),
            "--memory".to_string(),
            format!("{}b", spec.limits.memory_bytes),
            "--cpus".to_string(),
            format!("{:.3}", spec.limits.cpu_millis as f64 / 1000.0),
        ];
        if let Some(network) = &self.config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (k, v) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", k, v));
        }
        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }
        args.push(spec.image.clone());
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.config.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GatewayError::Runtime(format!("failed to run docker: {}", e)))?;
        if !output.status.success() {
            return Err(GatewayError::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn memory_usage(&self, handle: &InstanceHandle) -> Option<u64> {
        let args = [
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "{{.MemUsage}}".to_string(),
            handle.name.clone(),
        ];
        let out = self.docker(&args).await.ok()?;
        parse_mem_usage(&out)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<InstanceHandle> {
        // A leftover container with the same name blocks `docker run`
        let _ = self
            .docker(&["rm".to_string(), "-f".to_string(), spec.name.clone()])
            .await;
        let id = self.docker(&self.run_args(spec)).await?;
        info!(name = %spec.name, image = %spec.image, id = %id, "container started");
        Ok(InstanceHandle {
            id,
            name: spec.name.clone(),
        })
    }

    async fn stop(&self, handle: &InstanceHandle, grace: Duration) -> Result<()> {
        let stop = [
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            handle.name.clone(),
        ];
        if let Err(e) = self.docker(&stop).await {
            warn!(name = %handle.name, error = %e, "docker stop failed, forcing removal");
        }
        self.docker(&["rm".to_string(), "-f".to_string(), handle.name.clone()])
            .await?;
        info!(name = %handle.name, "container stopped");
        Ok(())
    }

    async fn inspect(&self, handle: &InstanceHandle) -> Result<RuntimeState> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{.State.ExitCode}} {{.State.OOMKilled}}".to_string(),
            handle.name.clone(),
        ];
        match self.docker(&args).await {
            Ok(out) => Ok(parse_inspect(&out)),
            Err(GatewayError::Runtime(msg)) if msg.contains("No such") => Ok(RuntimeState::Missing),
            Err(e) => Err(e),
        }
    }

    async fn probe(&self, handle: &InstanceHandle) -> Result<ComponentProbe> {
        let url = format!("http://{}:{}/health", handle.name, self.config.health_port);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::Connection {
                target: url.clone(),
                reason: e.to_string(),
            })?;
        let body: HealthBody = response.json().await.map_err(|e| GatewayError::Connection {
            target: url.clone(),
            reason: e.to_string(),
        })?;
        let readiness = match body.status.as_str() {
            "ok" | "ready" | "healthy" | "degraded" => Readiness::Ready,
            _ => Readiness::Starting,
        };
        Ok(ComponentProbe {
            readiness,
            circuit: body.circuit.unwrap_or_default(),
            memory_bytes: self.memory_usage(handle).await,
        })
    }
}

fn parse_inspect(out: &str) -> RuntimeState {
    let mut parts = out.split_whitespace();
    let status = parts.next().unwrap_or("");
    let code = parts.next().and_then(|c| c.parse().ok()).unwrap_or(0);
    let oom_killed = parts.next() == Some("true");
    match status {
        "running" | "created" | "restarting" => RuntimeState::Running,
        "exited" | "dead" => RuntimeState::Exited { code, oom_killed },
        _ => RuntimeState::Missing,
    }
}

/// Parse the used part of `docker stats` memory, e.g. `12.5MiB / 256MiB`
fn parse_mem_usage(out: &str) -> Option<u64> {
    let used = out.split('/').next()?.trim();
    let split = used.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = used.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let scale = match unit {
        "B" => 1.0,
        "kB" | "KB" => 1_000.0,
        "KiB" => 1_024.0,
        "MB" => 1_000_000.0,
        "MiB" => 1_048_576.0,
        "GB" => 1_000_000_000.0,
        "GiB" => 1_073_741_824.0,
        _ => return None,
    };
    Some((value * scale) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeloop::ComponentKind;

    #[test]
    fn test_spec_for_pipeline() {
        let pipeline = PipelineConfig::collector("press-1", "press-1", "collector-modbus:1.2");
        let spec = ContainerSpec::for_pipeline(&pipeline).unwrap();
        assert_eq!(spec.name, "sf-adapter-press-1");
        assert_eq!(spec.labels["app"], "edgeloop");
        assert_eq!(spec.labels["component"], ComponentKind::Collector.as_str());
        let json = &spec.env["ADAPTER_CONFIG_JSON"];
        let back: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(back, pipeline);
    }

    #[test]
    fn test_run_args_carry_limits() {
        let runtime = DockerCliRuntime::new(DockerConfig {
            network: Some("edge".into()),
            ..Default::default()
        })
        .unwrap();
        let mut pipeline = PipelineConfig::collector("p", "a", "img:1");
        pipeline.limits = ResourceLimits {
            memory_bytes: 64 * 1024 * 1024,
            cpu_millis: 250,
        };
        let args = runtime.run_args(&ContainerSpec::for_pipeline(&pipeline).unwrap());
        let joined = args.join(" ");
        assert!(joined.contains("--memory 67108864b"));
        assert!(joined.contains("--cpus 0.250"));
        assert!(joined.contains("--network edge"));
        assert_eq!(args.last().map(String::as_str), Some("img:1"));
    }

    #[test]
    fn test_parse_inspect() {
        assert_eq!(parse_inspect("running 0 false"), RuntimeState::Running);
        assert_eq!(
            parse_inspect("exited 137 true"),
            RuntimeState::Exited {
                code: 137,
                oom_killed: true
            }
        );
        assert_eq!(parse_inspect(""), RuntimeState::Missing);
    }

    #[test]
    fn test_parse_mem_usage() {
        assert_eq!(parse_mem_usage("1.5MiB / 256MiB"), Some(1_572_864));
        assert_eq!(parse_mem_usage("512B / 1GiB"), Some(512));
        assert_eq!(parse_mem_usage("--"), None);
    }
}
