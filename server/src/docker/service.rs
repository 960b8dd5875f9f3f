//! Service domain — Swarm service create/inspect/update/remove, task
//! status, and log collection.

use std::collections::HashMap;

use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointSpec, HealthConfig, Limit, Mount,
    MountTypeEnum, MountVolumeOptions, NetworkAttachmentConfig, ServiceSpec, ServiceSpecMode,
    ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec, TaskSpecContainerSpecPrivileges,
    TaskSpecResources, TaskSpecRestartPolicy, TaskSpecRestartPolicyConditionEnum, TaskState,
};
use bollard::query_parameters::{
    ListTasksOptionsBuilder, LogsOptions, UpdateServiceOptionsBuilder,
};
use futures::StreamExt;
use tracing::debug;

use super::{
    response_status, DockerDriver, DockerError, ServiceInfo, ServiceRequest, ServiceRuntimeStatus,
};

const NANOS_PER_SECOND: i64 = 1_000_000_000;
const RESTART_MAX_ATTEMPTS: i64 = 3;
const RESTART_DELAY_SECONDS: i64 = 5;

/// Build the full Swarm service spec for a request, with the hardened
/// defaults every workload gets: all capabilities dropped,
/// `no-new-privileges`, and an on-failure restart policy bounded to
/// [`RESTART_MAX_ATTEMPTS`] attempts with [`RESTART_DELAY_SECONDS`] backoff.
pub fn build_service_spec(request: &ServiceRequest) -> ServiceSpec {
    let mounts: Vec<Mount> = request
        .mounts
        .iter()
        .map(|mount| Mount {
            target: Some(mount.target.clone()),
            source: Some(mount.volume.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            volume_options: Some(MountVolumeOptions::default()),
            ..Default::default()
        })
        .collect();

    let healthcheck = request.healthcheck.as_ref().map(|hc| HealthConfig {
        test: Some(hc.test.clone()),
        interval: hc.interval_secs.map(|s| s as i64 * NANOS_PER_SECOND),
        timeout: hc.timeout_secs.map(|s| s as i64 * NANOS_PER_SECOND),
        retries: hc.retries.map(|r| r as i64),
        ..Default::default()
    });

    let resources = (request.cpu_limit.is_some() || request.memory_limit_mb.is_some()).then(|| {
        TaskSpecResources {
            limits: Some(Limit {
                nano_cpus: request
                    .cpu_limit
                    .map(|cpus| (cpus * NANOS_PER_SECOND as f64) as i64),
                memory_bytes: request.memory_limit_mb.map(|mb| mb * 1024 * 1024),
                ..Default::default()
            }),
            ..Default::default()
        }
    });

    let container_spec = TaskSpecContainerSpec {
        image: Some(request.image.clone()),
        env: Some(request.env.clone()),
        labels: Some(request.labels.clone()),
        mounts: (!mounts.is_empty()).then_some(mounts),
        capability_drop: Some(vec!["ALL".to_string()]),
        privileges: Some(TaskSpecContainerSpecPrivileges {
            no_new_privileges: Some(true),
            ..Default::default()
        }),
        health_check: healthcheck,
        ..Default::default()
    };

    let task_template = TaskSpec {
        container_spec: Some(container_spec),
        restart_policy: Some(TaskSpecRestartPolicy {
            condition: Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE),
            max_attempts: Some(RESTART_MAX_ATTEMPTS),
            delay: Some(RESTART_DELAY_SECONDS * NANOS_PER_SECOND),
            ..Default::default()
        }),
        resources,
        networks: Some(vec![NetworkAttachmentConfig {
            target: Some(request.network.clone()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let endpoint_spec = (!request.ports.is_empty()).then(|| EndpointSpec {
        ports: Some(
            request
                .ports
                .iter()
                .map(|port| EndpointPortConfig {
                    protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                    target_port: Some(port.container as i64),
                    published_port: Some(port.host as i64),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    });

    ServiceSpec {
        name: Some(request.name.clone()),
        labels: Some(request.labels.clone()),
        task_template: Some(task_template),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(request.replicas as i64),
            }),
            ..Default::default()
        }),
        endpoint_spec,
        ..Default::default()
    }
}

impl DockerDriver {
    pub(super) async fn create_service_inner(
        &self,
        request: ServiceRequest,
    ) -> Result<String, DockerError> {
        let name = request.name.clone();
        let spec = build_service_spec(&request);

        let response = self.client().create_service(spec, None).await?;
        let id = response.id.unwrap_or_default();
        debug!(service = name, id = %id, "created swarm service");

        Ok(id)
    }

    pub(super) async fn get_service_inner(
        &self,
        name: &str,
    ) -> Result<Option<ServiceInfo>, DockerError> {
        let service = match self
            .client()
            .inspect_service(name, None::<bollard::query_parameters::InspectServiceOptions>)
            .await
        {
            Ok(service) => service,
            Err(err) if response_status(&err) == Some(404) => return Ok(None),
            Err(err) => return Err(DockerError::from(err)),
        };

        let spec = service.spec.unwrap_or_default();
        let env = spec
            .task_template
            .as_ref()
            .and_then(|task| task.container_spec.as_ref())
            .and_then(|container| container.env.clone())
            .unwrap_or_default();

        Ok(Some(ServiceInfo {
            id: service.id.unwrap_or_default(),
            name: spec.name.unwrap_or_else(|| name.to_string()),
            env,
            labels: spec.labels.unwrap_or_default(),
            version: service.version.and_then(|v| v.index).unwrap_or_default(),
        }))
    }

    pub(super) async fn service_status_inner(
        &self,
        name: &str,
    ) -> Result<Option<ServiceRuntimeStatus>, DockerError> {
        if self.get_service_inner(name).await?.is_none() {
            return Ok(None);
        }

        let filters: HashMap<String, Vec<String>> =
            HashMap::from([("service".to_string(), vec![name.to_string()])]);
        let options = ListTasksOptionsBuilder::default().filters(&filters).build();

        let tasks = self.client().list_tasks(Some(options)).await?;

        let total_tasks = tasks.len() as u64;
        let running_tasks = tasks
            .iter()
            .filter(|task| {
                task.status
                    .as_ref()
                    .and_then(|status| status.state.as_ref())
                    .is_some_and(|state| *state == TaskState::RUNNING)
            })
            .count() as u64;
        // Tasks beyond the first are previous attempts.
        let restart_count = total_tasks.saturating_sub(1) as i64;

        Ok(Some(ServiceRuntimeStatus {
            running_tasks,
            total_tasks,
            restart_count,
        }))
    }

    pub(super) async fn update_service_env_inner(
        &self,
        name: &str,
        merge: Vec<(String, String)>,
    ) -> Result<(), DockerError> {
        let service = self
            .client()
            .inspect_service(name, None::<bollard::query_parameters::InspectServiceOptions>)
            .await?;

        let version = service.version.and_then(|v| v.index).unwrap_or_default();
        let mut spec = service.spec.unwrap_or_default();

        if let Some(container) = spec
            .task_template
            .as_mut()
            .and_then(|task| task.container_spec.as_mut())
        {
            let mut env = container.env.take().unwrap_or_default();
            for (key, value) in merge {
                env.retain(|entry| entry.split('=').next() != Some(key.as_str()));
                env.push(format!("{key}={value}"));
            }
            container.env = Some(env);
        }

        let options = UpdateServiceOptionsBuilder::default()
            .version(version as i32)
            .build();

        self.client()
            .update_service(name, spec, options, None)
            .await?;

        Ok(())
    }

    pub(super) async fn remove_service_inner(&self, name: &str) -> Result<(), DockerError> {
        match self.client().delete_service(name).await {
            Ok(()) => Ok(()),
            Err(err) if response_status(&err) == Some(404) => {
                debug!(service = name, "service already gone");
                Ok(())
            }
            Err(err) => Err(DockerError::from(err)),
        }
    }

    pub(super) async fn service_logs_inner(
        &self,
        name: &str,
        tail: u32,
    ) -> Result<Vec<u8>, DockerError> {
        let options = LogsOptions {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client().service_logs(name, Some(options));
        let mut buffer = Vec::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?.into_bytes());
        }

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use runway_common::models::deployment::{HealthcheckSpec, PortSpec};

    use super::*;
    use crate::docker::{managed_labels, MountRequest, LABEL_ENV_ID};

    fn request() -> ServiceRequest {
        ServiceRequest {
            name: "job_demo_abcdefghijklmnop".to_string(),
            image: "nginx:alpine".to_string(),
            replicas: 2,
            network: "overlay_env_demo_1700000000000".to_string(),
            env: vec!["FOO=bar".to_string()],
            labels: managed_labels([(LABEL_ENV_ID, "e1".to_string())]),
            mounts: vec![MountRequest {
                volume: "vol_demo_data".to_string(),
                target: "/data".to_string(),
            }],
            ports: vec![PortSpec {
                container: 80,
                host: 8080,
            }],
            healthcheck: Some(HealthcheckSpec {
                test: vec!["CMD-SHELL".to_string(), "true".to_string()],
                interval_secs: Some(10),
                timeout_secs: Some(2),
                retries: Some(3),
            }),
            cpu_limit: Some(0.5),
            memory_limit_mb: Some(256),
        }
    }

    #[test]
    fn spec_carries_hardened_defaults() {
        let spec = build_service_spec(&request());

        let container = spec
            .task_template
            .as_ref()
            .unwrap()
            .container_spec
            .as_ref()
            .unwrap();
        assert_eq!(container.capability_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(
            container
                .privileges
                .as_ref()
                .unwrap()
                .no_new_privileges,
            Some(true)
        );

        let restart = spec
            .task_template
            .as_ref()
            .unwrap()
            .restart_policy
            .as_ref()
            .unwrap();
        assert_eq!(
            restart.condition,
            Some(TaskSpecRestartPolicyConditionEnum::ON_FAILURE)
        );
        assert_eq!(restart.max_attempts, Some(3));
        assert_eq!(restart.delay, Some(5 * NANOS_PER_SECOND));
    }

    #[test]
    fn spec_attaches_only_the_overlay() {
        let spec = build_service_spec(&request());
        let networks = spec.task_template.unwrap().networks.unwrap();

        assert_eq!(networks.len(), 1);
        assert_eq!(
            networks[0].target.as_deref(),
            Some("overlay_env_demo_1700000000000")
        );
    }

    #[test]
    fn spec_translates_ports_mounts_and_limits() {
        let spec = build_service_spec(&request());

        let ports = spec.endpoint_spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].target_port, Some(80));
        assert_eq!(ports[0].published_port, Some(8080));

        let task = spec.task_template.unwrap();
        let mounts = task.container_spec.as_ref().unwrap().mounts.clone().unwrap();
        assert_eq!(mounts[0].source.as_deref(), Some("vol_demo_data"));
        assert_eq!(mounts[0].target.as_deref(), Some("/data"));
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::VOLUME));

        let limits = task.resources.unwrap().limits.unwrap();
        assert_eq!(limits.nano_cpus, Some(500_000_000));
        assert_eq!(limits.memory_bytes, Some(256 * 1024 * 1024));

        let replicas = spec.mode.unwrap().replicated.unwrap().replicas;
        assert_eq!(replicas, Some(2));
    }

    #[test]
    fn minimal_request_omits_optional_sections() {
        let request = ServiceRequest {
            mounts: Vec::new(),
            ports: Vec::new(),
            healthcheck: None,
            cpu_limit: None,
            memory_limit_mb: None,
            ..request()
        };
        let spec = build_service_spec(&request);

        assert!(spec.endpoint_spec.is_none());
        let task = spec.task_template.unwrap();
        assert!(task.resources.is_none());
        let container = task.container_spec.unwrap();
        assert!(container.mounts.is_none());
        assert!(container.health_check.is_none());
    }
}
