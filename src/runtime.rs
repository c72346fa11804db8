//! Runtime metadata probe.
//!
//! Detects the execution environment (container orchestrator task, serverless
//! function, CI build, or a plain host) from ambient environment variables
//! and, for orchestrator tasks, the task metadata endpoint. The resulting
//! descriptor maps are reported at registration and optionally refreshed on
//! an interval when the source is not static.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

const METADATA_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Descriptor of the environment this supervisor is running in.
#[derive(Debug, Clone)]
pub struct RuntimeMetadata {
    /// Short label, e.g. "container-task", "serverless", "build", "generic"
    pub execution_method_type: String,
    /// Facts about this particular execution
    pub execution_method: Value,
    /// Facts about what this environment can run, reported for auto-created
    /// Tasks
    pub execution_method_capability: Value,
    /// The unprocessed source payload
    pub raw: Value,
    /// Cross-cutting derived facts (network, region)
    pub derived: Value,
    /// The source can report a peer container's exit (sidecar mode)
    pub is_execution_status_source: bool,
}

/// Exit report for a monitored peer container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited(i32),
    Unknown,
}

/// Fetches runtime metadata; pluggable so embedders can substitute their own
/// environment probe.
#[async_trait]
pub trait RuntimeMetadataFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Option<RuntimeMetadata>>;

    /// Static sources never change, so they are fetched once.
    fn is_static(&self) -> bool {
        true
    }

    /// Poll a named peer container's state, for sidecar mode.
    async fn poll_container(&self, _container_name: &str) -> Result<ContainerState> {
        Err(Error::Internal(
            "this runtime cannot observe peer containers".to_string(),
        ))
    }
}

/// The default probe: orchestrator endpoint, then serverless, then CI build,
/// then a generic host descriptor.
pub struct DefaultRuntimeMetadataFetcher {
    env: HashMap<String, String>,
    http: reqwest::Client,
}

impl DefaultRuntimeMetadataFetcher {
    pub fn new(env: HashMap<String, String>) -> Self {
        Self {
            env,
            http: reqwest::Client::new(),
        }
    }

    fn metadata_endpoint(&self) -> Option<String> {
        self.env
            .get("ECS_CONTAINER_METADATA_URI_V4")
            .or_else(|| self.env.get("ECS_CONTAINER_METADATA_URI"))
            .cloned()
    }

    async fn fetch_container_task_metadata(&self) -> Result<Option<RuntimeMetadata>> {
        let Some(endpoint) = self.metadata_endpoint() else {
            return Ok(None);
        };

        let url = format!("{}/task", endpoint.trim_end_matches('/'));
        debug!("Fetching task metadata from {url}");

        let raw: Value = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .timeout(METADATA_ENDPOINT_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Api(format!("task metadata endpoint failed: {e}")))?
            .json()
            .await?;

        Ok(Some(convert_container_task_metadata(&raw)))
    }

    fn fetch_serverless_metadata(&self) -> Option<RuntimeMetadata> {
        let function_name = self.env.get("AWS_LAMBDA_FUNCTION_NAME")?;

        let memory_mb = self
            .env
            .get("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
            .and_then(|m| m.parse::<i64>().ok());
        let region = self
            .env
            .get("AWS_REGION")
            .or_else(|| self.env.get("AWS_DEFAULT_REGION"))
            .cloned();

        let mut method = Map::new();
        method.insert("type".to_string(), json!("serverless"));
        method.insert("function_name".to_string(), json!(function_name));
        if let Some(version) = self.env.get("AWS_LAMBDA_FUNCTION_VERSION") {
            method.insert("function_version".to_string(), json!(version));
        }
        if let Some(memory) = memory_mb {
            method.insert("allocated_memory_mb".to_string(), json!(memory));
        }

        let derived = json!({
            "network": { "region": region }
        });

        Some(RuntimeMetadata {
            execution_method_type: "serverless".to_string(),
            execution_method: Value::Object(method.clone()),
            execution_method_capability: Value::Object(method),
            raw: Value::Null,
            derived,
            is_execution_status_source: false,
        })
    }

    fn fetch_build_metadata(&self) -> Option<RuntimeMetadata> {
        let mut method = Map::new();

        if let Some(build_arn) = self.env.get("CODEBUILD_BUILD_ARN") {
            method.insert("type".to_string(), json!("build"));
            method.insert("build_arn".to_string(), json!(build_arn));
            if let Some(image) = self.env.get("CODEBUILD_BUILD_IMAGE") {
                method.insert("build_image".to_string(), json!(image));
            }
        } else if self.env.get("GITHUB_ACTIONS").map(String::as_str) == Some("true") {
            method.insert("type".to_string(), json!("build"));
            if let Some(repo) = self.env.get("GITHUB_REPOSITORY") {
                method.insert("repository".to_string(), json!(repo));
            }
            if let Some(run_id) = self.env.get("GITHUB_RUN_ID") {
                method.insert("run_id".to_string(), json!(run_id));
            }
        } else {
            return None;
        }

        Some(RuntimeMetadata {
            execution_method_type: "build".to_string(),
            execution_method: Value::Object(method.clone()),
            execution_method_capability: Value::Object(method),
            raw: Value::Null,
            derived: Value::Null,
            is_execution_status_source: false,
        })
    }

    fn fetch_generic_metadata(&self) -> RuntimeMetadata {
        let mut method = Map::new();
        method.insert("type".to_string(), json!("generic"));
        if let Ok(name) = hostname::get() {
            if let Some(name) = name.to_str() {
                method.insert("hostname".to_string(), json!(name));
            }
        }
        method.insert("os".to_string(), json!(std::env::consts::OS));

        RuntimeMetadata {
            execution_method_type: "generic".to_string(),
            execution_method: Value::Object(method.clone()),
            execution_method_capability: Value::Object(method),
            raw: Value::Null,
            derived: Value::Null,
            is_execution_status_source: false,
        }
    }
}

#[async_trait]
impl RuntimeMetadataFetcher for DefaultRuntimeMetadataFetcher {
    async fn fetch(&self) -> Result<Option<RuntimeMetadata>> {
        match self.fetch_container_task_metadata().await {
            Ok(Some(metadata)) => return Ok(Some(metadata)),
            Ok(None) => {}
            Err(e) => warn!("Task metadata endpoint unusable: {e}"),
        }

        if let Some(metadata) = self.fetch_serverless_metadata() {
            return Ok(Some(metadata));
        }
        if let Some(metadata) = self.fetch_build_metadata() {
            return Ok(Some(metadata));
        }

        Ok(Some(self.fetch_generic_metadata()))
    }

    fn is_static(&self) -> bool {
        // The orchestrator endpoint reflects live task state
        self.metadata_endpoint().is_none()
    }

    async fn poll_container(&self, container_name: &str) -> Result<ContainerState> {
        let Some(endpoint) = self.metadata_endpoint() else {
            return Err(Error::Internal(
                "no task metadata endpoint for container polling".to_string(),
            ));
        };

        let url = format!("{}/task", endpoint.trim_end_matches('/'));
        let raw: Value = self
            .http
            .get(&url)
            .timeout(METADATA_ENDPOINT_TIMEOUT)
            .send()
            .await?
            .json()
            .await?;

        Ok(container_state_from_task(&raw, container_name))
    }
}

/// Pull the interesting facts out of an orchestrator task payload.
fn convert_container_task_metadata(raw: &Value) -> RuntimeMetadata {
    let cluster = raw.get("Cluster").and_then(Value::as_str).unwrap_or("");
    let task_arn = raw.get("TaskARN").and_then(Value::as_str).unwrap_or("");

    let mut method = Map::new();
    method.insert("type".to_string(), json!("container-task"));
    method.insert("task_arn".to_string(), json!(task_arn));
    method.insert("cluster_arn".to_string(), json!(cluster));

    let mut capability = Map::new();
    capability.insert("type".to_string(), json!("container-task"));
    capability.insert("default_cluster_arn".to_string(), json!(cluster));

    if let Some(definition_arn) = task_definition_arn(raw) {
        method.insert("task_definition_arn".to_string(), json!(definition_arn));
        capability.insert("task_definition_arn".to_string(), json!(definition_arn));
    }

    if let Some(launch_type) = raw.get("LaunchType").and_then(Value::as_str) {
        method.insert("launch_type".to_string(), json!(launch_type));
        capability.insert("default_launch_type".to_string(), json!(launch_type));
        capability.insert("supported_launch_types".to_string(), json!([launch_type]));
    }

    if let Some(limits) = raw.get("Limits").and_then(Value::as_object) {
        if let Some(cpu) = limits.get("CPU").and_then(Value::as_f64) {
            let units = (cpu * 1024.0).round() as i64;
            method.insert("allocated_cpu_units".to_string(), json!(units));
            capability.insert("allocated_cpu_units".to_string(), json!(units));
        }
        if let Some(memory) = limits.get("Memory").and_then(Value::as_i64) {
            method.insert("allocated_memory_mb".to_string(), json!(memory));
            capability.insert("allocated_memory_mb".to_string(), json!(memory));
        }
    }

    let availability_zone = raw.get("AvailabilityZone").and_then(Value::as_str);
    let region = availability_zone
        .map(zone_to_region)
        .or_else(|| region_from_cluster_arn(cluster));

    let derived = json!({
        "network": {
            "availability_zone": availability_zone,
            "region": region,
        }
    });

    RuntimeMetadata {
        execution_method_type: "container-task".to_string(),
        execution_method: Value::Object(method),
        execution_method_capability: Value::Object(capability),
        raw: raw.clone(),
        derived,
        is_execution_status_source: true,
    }
}

/// `<prefix>:task/...` plus Family and Revision make a task definition ARN.
fn task_definition_arn(raw: &Value) -> Option<String> {
    let task_arn = raw.get("TaskARN").and_then(Value::as_str)?;
    let family = raw.get("Family").and_then(Value::as_str)?;
    let revision = raw.get("Revision").and_then(Value::as_str)?;
    let prefix_end = task_arn.find(":task/")?;
    Some(format!(
        "{}:task-definition/{}:{}",
        &task_arn[..prefix_end],
        family,
        revision
    ))
}

/// Drop the trailing zone letter: "us-west-1a" -> "us-west-1".
fn zone_to_region(zone: &str) -> String {
    let mut region = zone.to_string();
    region.pop();
    region
}

fn region_from_cluster_arn(cluster_arn: &str) -> Option<String> {
    let parts: Vec<&str> = cluster_arn.split(':').collect();
    if parts.len() > 3 && parts[0] == "arn" {
        Some(parts[3].to_string())
    } else {
        None
    }
}

fn container_state_from_task(raw: &Value, container_name: &str) -> ContainerState {
    let Some(containers) = raw.get("Containers").and_then(Value::as_array) else {
        return ContainerState::Unknown;
    };

    for container in containers {
        let name = container.get("Name").and_then(Value::as_str);
        if name != Some(container_name) {
            continue;
        }
        let status = container
            .get("KnownStatus")
            .and_then(Value::as_str)
            .unwrap_or("");
        if status.eq_ignore_ascii_case("stopped") {
            let code = container
                .get("ExitCode")
                .and_then(Value::as_i64)
                .unwrap_or(-1) as i32;
            return ContainerState::Exited(code);
        }
        return ContainerState::Running;
    }

    ContainerState::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_generic_fallback() {
        let fetcher = DefaultRuntimeMetadataFetcher::new(HashMap::new());
        let metadata = fetcher.fetch().await.unwrap().unwrap();
        assert_eq!(metadata.execution_method_type, "generic");
        assert!(fetcher.is_static());
    }

    #[tokio::test]
    async fn test_serverless_detection() {
        let fetcher = DefaultRuntimeMetadataFetcher::new(env_of(&[
            ("AWS_LAMBDA_FUNCTION_NAME", "fn-1"),
            ("AWS_LAMBDA_FUNCTION_MEMORY_SIZE", "512"),
            ("AWS_REGION", "eu-west-1"),
        ]));
        let metadata = fetcher.fetch().await.unwrap().unwrap();
        assert_eq!(metadata.execution_method_type, "serverless");
        assert_eq!(metadata.execution_method["function_name"], json!("fn-1"));
        assert_eq!(metadata.execution_method["allocated_memory_mb"], json!(512));
        assert_eq!(metadata.derived["network"]["region"], json!("eu-west-1"));
    }

    #[tokio::test]
    async fn test_build_detection() {
        let fetcher = DefaultRuntimeMetadataFetcher::new(env_of(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_REPOSITORY", "org/repo"),
        ]));
        let metadata = fetcher.fetch().await.unwrap().unwrap();
        assert_eq!(metadata.execution_method_type, "build");
        assert_eq!(metadata.execution_method["repository"], json!("org/repo"));
    }

    #[test]
    fn test_convert_container_task_metadata() {
        let raw = json!({
            "Cluster": "arn:aws:ecs:us-west-2:123:cluster/main",
            "TaskARN": "arn:aws:ecs:us-west-2:123:task/main/abc",
            "Family": "etl",
            "Revision": "7",
            "LaunchType": "FARGATE",
            "Limits": {"CPU": 0.5, "Memory": 1024},
            "AvailabilityZone": "us-west-2a"
        });
        let metadata = convert_container_task_metadata(&raw);

        assert_eq!(metadata.execution_method_type, "container-task");
        assert!(metadata.is_execution_status_source);
        assert_eq!(
            metadata.execution_method["task_definition_arn"],
            json!("arn:aws:ecs:us-west-2:123:task-definition/etl:7")
        );
        assert_eq!(metadata.execution_method["allocated_cpu_units"], json!(512));
        assert_eq!(metadata.derived["network"]["region"], json!("us-west-2"));
        assert_eq!(
            metadata.execution_method_capability["supported_launch_types"],
            json!(["FARGATE"])
        );
    }

    #[test]
    fn test_region_from_cluster_arn_fallback() {
        let raw = json!({
            "Cluster": "arn:aws:ecs:ap-south-1:123:cluster/x",
            "TaskARN": "arn:aws:ecs:ap-south-1:123:task/x/1",
        });
        let metadata = convert_container_task_metadata(&raw);
        assert_eq!(metadata.derived["network"]["region"], json!("ap-south-1"));
    }

    #[test]
    fn test_container_state() {
        let raw = json!({
            "Containers": [
                {"Name": "app", "KnownStatus": "STOPPED", "ExitCode": 3},
                {"Name": "warden", "KnownStatus": "RUNNING"}
            ]
        });
        assert_eq!(
            container_state_from_task(&raw, "app"),
            ContainerState::Exited(3)
        );
        assert_eq!(
            container_state_from_task(&raw, "warden"),
            ContainerState::Running
        );
        assert_eq!(
            container_state_from_task(&raw, "ghost"),
            ContainerState::Unknown
        );
    }
}
