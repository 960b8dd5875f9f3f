//! Typed wrapper over the Docker Engine API.
//!
//! The driver owns every label convention and all error normalization
//! (which 404s and 409s are successes, which are warnings). Domain methods
//! live in sibling modules (`network`, `volume`, `image`, `service`) which
//! add `impl DockerDriver` blocks; [`DockerOps`] is the seam services are
//! written against.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use runway_common::models::deployment::{HealthcheckSpec, PortSpec};
use thiserror::Error;

mod image;
mod network;
mod service;
mod volume;

pub use image::BuildProgress;
pub use service::build_service_spec;

/// Label stamped on every resource this process creates. Discovery and
/// cleanup are scoped to resources carrying it; nothing else is ever
/// removed.
pub const MANAGED_LABEL: &str = "runway.managed";
pub const LABEL_USER_ID: &str = "runway.user_id";
pub const LABEL_ENV_ID: &str = "runway.env_id";
pub const LABEL_DEPLOYMENT_ID: &str = "runway.deployment_id";

/// `managed=true` plus the given owner labels.
pub fn managed_labels<I>(extra: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'static str, String)>,
{
    let mut labels = HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]);
    labels.extend(extra.into_iter().map(|(k, v)| (k.to_string(), v)));
    labels
}

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("docker connection failed: {0}")]
    Connection(String),
    #[error("this node is not an active swarm manager")]
    NotSwarmManager,
    #[error("image build failed: {0}")]
    Build(String),
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),
}

/// Status code of a Docker engine error response, if that is what this is.
fn response_status(err: &bollard::errors::Error) -> Option<u16> {
    match err {
        bollard::errors::Error::DockerResponseServerError { status_code, .. } => {
            Some(*status_code)
        }
        _ => None,
    }
}

/// Outcome of a volume removal after normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeRemoval {
    Removed,
    /// 404: nothing to do.
    Absent,
    /// 409: still mounted somewhere; a warning, not a failure.
    InUse,
}

/// Everything the driver needs to realise one Swarm service.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub name: String,
    /// Full image reference, `image:tag`.
    pub image: String,
    pub replicas: u64,
    /// The overlay network the service is attached to -- and nothing else.
    pub network: String,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountRequest>,
    pub ports: Vec<PortSpec>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MountRequest {
    pub volume: String,
    pub target: String,
}

/// A live service as reported by the engine.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub version: u64,
}

/// Aggregated task-level status of one service.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceRuntimeStatus {
    pub running_tasks: u64,
    pub total_tasks: u64,
    pub restart_count: i64,
}

/// The driver operations services are built against. Implemented by
/// [`DockerDriver`]; tests substitute an in-memory fake.
#[async_trait]
pub trait DockerOps: Send + Sync {
    /// Verify the engine is reachable and this node is an active swarm
    /// manager; initialise the swarm when allowed to.
    async fn ensure_swarm(&self, advertise_addr: Option<&str>) -> Result<(), DockerError>;

    async fn create_overlay_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String, DockerError>;
    /// Network id when a network by this name exists.
    async fn find_network(&self, name: &str) -> Result<Option<String>, DockerError>;
    /// 404 is success.
    async fn delete_network(&self, name: &str) -> Result<(), DockerError>;
    /// "already connected" is success.
    async fn connect_container(&self, network: &str, container: &str) -> Result<(), DockerError>;
    /// 404 is success.
    async fn disconnect_container(&self, network: &str, container: &str)
        -> Result<(), DockerError>;

    /// 409 (already exists) is success.
    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), DockerError>;
    async fn remove_volume(&self, name: &str) -> Result<VolumeRemoval, DockerError>;
    async fn list_volumes_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, DockerError>;

    /// Follows pull progress to completion.
    async fn pull_image(&self, image: &str, tag: &str) -> Result<(), DockerError>;
    /// Streams a tar build context to the engine and follows the build
    /// event stream; see [`BuildProgress`] for the success/failure rules.
    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<(), DockerError>;

    async fn create_service(&self, request: ServiceRequest) -> Result<String, DockerError>;
    /// `None` on 404.
    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>, DockerError>;
    async fn service_status(
        &self,
        name: &str,
    ) -> Result<Option<ServiceRuntimeStatus>, DockerError>;
    /// Merge env pairs into the service spec in place (same service, bumped
    /// spec version).
    async fn update_service_env(
        &self,
        name: &str,
        merge: Vec<(String, String)>,
    ) -> Result<(), DockerError>;
    /// 404 is success.
    async fn remove_service(&self, name: &str) -> Result<(), DockerError>;
    /// Combined, timestamped stdout+stderr bytes.
    async fn service_logs(&self, name: &str, tail: u32) -> Result<Vec<u8>, DockerError>;
}

#[derive(Clone)]
pub struct DockerDriver {
    client: Docker,
}

impl DockerDriver {
    pub fn new(socket_path: &str) -> Result<Self, DockerError> {
        let client = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| DockerError::Connection(e.to_string()))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| DockerError::Connection(e.to_string()))?
        };

        Ok(Self { client })
    }

    pub(super) fn client(&self) -> &Docker {
        &self.client
    }
}

#[async_trait]
impl DockerOps for DockerDriver {
    async fn ensure_swarm(&self, advertise_addr: Option<&str>) -> Result<(), DockerError> {
        self.ensure_swarm_inner(advertise_addr).await
    }

    async fn create_overlay_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String, DockerError> {
        self.create_overlay_network_inner(name, labels).await
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, DockerError> {
        self.find_network_inner(name).await
    }

    async fn delete_network(&self, name: &str) -> Result<(), DockerError> {
        self.delete_network_inner(name).await
    }

    async fn connect_container(&self, network: &str, container: &str) -> Result<(), DockerError> {
        self.connect_container_inner(network, container).await
    }

    async fn disconnect_container(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), DockerError> {
        self.disconnect_container_inner(network, container).await
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), DockerError> {
        self.create_volume_inner(name, labels).await
    }

    async fn remove_volume(&self, name: &str) -> Result<VolumeRemoval, DockerError> {
        self.remove_volume_inner(name).await
    }

    async fn list_volumes_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, DockerError> {
        self.list_volumes_by_label_inner(key, value).await
    }

    async fn pull_image(&self, image: &str, tag: &str) -> Result<(), DockerError> {
        self.pull_image_inner(image, tag).await
    }

    async fn build_image(&self, context: Vec<u8>, tag: &str) -> Result<(), DockerError> {
        self.build_image_inner(context, tag).await
    }

    async fn create_service(&self, request: ServiceRequest) -> Result<String, DockerError> {
        self.create_service_inner(request).await
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceInfo>, DockerError> {
        self.get_service_inner(name).await
    }

    async fn service_status(
        &self,
        name: &str,
    ) -> Result<Option<ServiceRuntimeStatus>, DockerError> {
        self.service_status_inner(name).await
    }

    async fn update_service_env(
        &self,
        name: &str,
        merge: Vec<(String, String)>,
    ) -> Result<(), DockerError> {
        self.update_service_env_inner(name, merge).await
    }

    async fn remove_service(&self, name: &str) -> Result<(), DockerError> {
        self.remove_service_inner(name).await
    }

    async fn service_logs(&self, name: &str, tail: u32) -> Result<Vec<u8>, DockerError> {
        self.service_logs_inner(name, tail).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_labels_always_carry_the_marker() {
        let labels = managed_labels([(LABEL_ENV_ID, "e1".to_string())]);
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(LABEL_ENV_ID).map(String::as_str), Some("e1"));
    }
}
