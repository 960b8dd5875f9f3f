use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::environment::EnvironmentStatus;

/// Progress of a deployment through the pipeline. Stored as the string form
/// in `deployments.status`; variant order is lifecycle order, so a poller
/// must only ever observe a strictly increasing sequence (or a jump to
/// `Failed`/`Stopped`).
///
/// Registry-sourced deployments pass through `PullingImage`; Git-sourced
/// ones pass through `BuildingImage` instead.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    BuildingImage,
    PullingImage,
    CreatingVolumes,
    StartingContainers,
    Running,
    Failed,
    Stopped,
}

impl DeploymentStatus {
    /// Terminal states never transition again (short of row deletion).
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Failed | DeploymentStatus::Stopped)
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Creating,
    Running,
    Stopped,
    Failed,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceHealth {
    Healthy,
    Unhealthy,
    Starting,
    None,
}

/// A container-to-host port publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub container: u16,
    pub host: u16,
}

/// A named volume and where it mounts inside the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthcheckSpec {
    /// Exec-form command, e.g. `["CMD-SHELL", "curl -f localhost/health"]`.
    pub test: Vec<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u64>,
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_replicas() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeploymentRequest {
    pub environment_id: String,
    pub image: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default = "default_replicas")]
    pub replicas: u64,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub virtual_host: Option<String>,
    #[serde(default)]
    pub virtual_port: Option<u16>,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckSpec>,
    /// Fractional CPUs, e.g. `0.5`.
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGitDeploymentRequest {
    pub environment_id: String,
    pub git_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u64,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub virtual_host: Option<String>,
    #[serde(default)]
    pub virtual_port: Option<u16>,
    #[serde(default)]
    pub healthcheck: Option<HealthcheckSpec>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

/// The immediate answer to a deployment request; everything else is
/// observed by polling the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentCreatedResponse {
    pub job_id: String,
    pub deployment_id: String,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    pub name: String,
    pub status: ServiceStatus,
    pub health: ServiceHealth,
    pub restart_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentEnvironmentSummary {
    pub id: String,
    pub name: String,
    pub status: EnvironmentStatus,
    pub is_public: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResponse {
    pub id: String,
    pub job_id: String,
    pub image: String,
    pub tag: String,
    pub replicas: u64,
    pub ports: Vec<PortSpec>,
    pub volumes: Vec<VolumeSpec>,
    pub status: DeploymentStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_version: i64,
    pub git_url: Option<String>,
    pub git_branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub service: Option<ServiceResponse>,
    pub environment: Option<DeploymentEnvironmentSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_is_lifecycle_order() {
        use DeploymentStatus::*;

        let order = [
            Pending,
            BuildingImage,
            PullingImage,
            CreatingVolumes,
            StartingContainers,
            Running,
            Failed,
            Stopped,
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(DeploymentStatus::PullingImage.to_string(), "PULLING_IMAGE");
        assert_eq!(DeploymentStatus::BuildingImage.to_string(), "BUILDING_IMAGE");
        assert_eq!(
            "STARTING_CONTAINERS".parse::<DeploymentStatus>().unwrap(),
            DeploymentStatus::StartingContainers
        );
        assert_eq!(ServiceHealth::None.to_string(), "NONE");
    }

    #[test]
    fn registry_request_fills_defaults() {
        let req: CreateDeploymentRequest = serde_json::from_str(
            r#"{"environmentId": "env_1", "image": "nginx"}"#,
        )
        .unwrap();
        assert_eq!(req.tag, "latest");
        assert_eq!(req.replicas, 1);
        assert!(req.ports.is_empty());
        assert!(req.env_vars.is_empty());
    }
}
