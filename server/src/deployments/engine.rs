use std::sync::Arc;

use chrono::Utc;
use runway_common::key::random_token;
use runway_common::models::deployment::{
    CreateDeploymentRequest, CreateGitDeploymentRequest, DeploymentCreatedResponse,
    DeploymentEnvironmentSummary, DeploymentResponse, DeploymentStatus, ServiceHealth,
    ServiceResponse,
};
use runway_common::models::environment::EnvironmentStatus;
use runway_common::JOB_ID_LENGTH;
use tokio::sync::mpsc;
use tracing::{instrument, warn};

use super::buildfile::GitBuildSpec;
use super::names;
use super::worker::{WorkItem, WorkKind};
use crate::docker::DockerOps;
use crate::error::{Error, ErrorKind};
use crate::events::{Event, EventBus};
use crate::persistence::{new_id, Deployment, Environment, Persistence, ServiceRecord};

/// Synchronous face of the deployment pipeline. Creation persists desired
/// state, hands a typed message to the worker queue, and returns before any
/// driver side effect happens; everything later is observed through the
/// polled job.
#[derive(Clone)]
pub struct DeploymentEngine {
    store: Persistence,
    driver: Arc<dyn DockerOps>,
    bus: EventBus,
    queue: mpsc::Sender<WorkItem>,
}

impl DeploymentEngine {
    pub fn new(
        store: Persistence,
        driver: Arc<dyn DockerOps>,
        bus: EventBus,
        queue: mpsc::Sender<WorkItem>,
    ) -> Self {
        Self {
            store,
            driver,
            bus,
            queue,
        }
    }

    #[instrument(skip(self, request))]
    pub async fn create_from_registry(
        &self,
        user_id: &str,
        request: CreateDeploymentRequest,
    ) -> Result<DeploymentCreatedResponse, Error> {
        let env = self.active_owned_env(user_id, &request.environment_id).await?;

        if request.image.trim().is_empty() {
            return Err(Error::bad_request("image is required"));
        }
        if request.replicas == 0 {
            return Err(Error::bad_request("replicas must be at least 1"));
        }

        let deployment = Deployment {
            deployment_id: new_id(),
            env_id: env.env_id.clone(),
            job_id: random_token(JOB_ID_LENGTH),
            image: request.image,
            tag: request.tag,
            replicas: request.replicas as i64,
            ports: request.ports,
            env_vars: request.env_vars,
            volumes: request.volumes,
            virtual_host: request.virtual_host,
            virtual_port: request.virtual_port.map(i64::from),
            healthcheck: request.healthcheck,
            cpu_limit: request.cpu_limit,
            memory_limit_mb: request.memory_limit_mb.map(|mb| mb as i64),
            status: DeploymentStatus::Pending,
            error_message: None,
            started_at: None,
            completed_at: None,
            current_version: 1,
            git_url: None,
            git_branch: None,
            git_commit_sha: None,
            created_at: Utc::now(),
        };

        self.enqueue(deployment, WorkKind::Registry, &env).await
    }

    #[instrument(skip(self, request))]
    pub async fn create_from_git(
        &self,
        user_id: &str,
        request: CreateGitDeploymentRequest,
    ) -> Result<DeploymentCreatedResponse, Error> {
        let env = self.active_owned_env(user_id, &request.environment_id).await?;

        if request.git_url.trim().is_empty() {
            return Err(Error::bad_request("gitUrl is required"));
        }
        if request.replicas == 0 {
            return Err(Error::bad_request("replicas must be at least 1"));
        }

        let build = GitBuildSpec::new(
            request.git_url.clone(),
            request.branch.clone(),
            request.base_image,
            request.install_command,
            request.build_command,
            request.start_command,
        );

        let deployment = Deployment {
            deployment_id: new_id(),
            env_id: env.env_id.clone(),
            job_id: random_token(JOB_ID_LENGTH),
            image: names::image_name(&env.name, Utc::now().timestamp()),
            tag: names::image_tag(request.branch.as_deref()),
            replicas: request.replicas as i64,
            ports: request.ports,
            env_vars: request.env_vars,
            volumes: request.volumes,
            virtual_host: request.virtual_host,
            virtual_port: request.virtual_port.map(i64::from),
            healthcheck: request.healthcheck,
            cpu_limit: request.cpu_limit,
            memory_limit_mb: request.memory_limit_mb.map(|mb| mb as i64),
            status: DeploymentStatus::Pending,
            error_message: None,
            started_at: None,
            completed_at: None,
            current_version: 1,
            git_url: Some(request.git_url),
            git_branch: Some(build.branch.clone()),
            git_commit_sha: None,
            created_at: Utc::now(),
        };

        self.enqueue(deployment, WorkKind::Git(build), &env).await
    }

    async fn enqueue(
        &self,
        deployment: Deployment,
        kind: WorkKind,
        env: &Environment,
    ) -> Result<DeploymentCreatedResponse, Error> {
        self.store.deployments().insert(&deployment).await?;

        self.queue
            .send(WorkItem {
                deployment_id: deployment.deployment_id.clone(),
                kind,
                overlay_name: env.overlay_name.clone(),
            })
            .await?;

        Ok(DeploymentCreatedResponse {
            job_id: deployment.job_id,
            deployment_id: deployment.deployment_id,
            status: DeploymentStatus::Pending,
        })
    }

    pub async fn get_status(
        &self,
        user_id: &str,
        job_id: &str,
    ) -> Result<DeploymentResponse, Error> {
        let deployment = self
            .store
            .deployments()
            .get_by_job(user_id, job_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        if deployment.status == DeploymentStatus::Running {
            self.refresh_service_health(&deployment.deployment_id).await;
        }

        self.to_response(deployment).await
    }

    /// Best-effort: fold the driver's task-level view into the service row
    /// so pollers see live health. Driver trouble is not the poller's
    /// problem.
    async fn refresh_service_health(&self, deployment_id: &str) {
        let repo = self.store.deployments();
        let Ok(Some(service)) = repo.get_service(deployment_id).await else {
            return;
        };

        match self.driver.service_status(&service.name).await {
            Ok(Some(status)) => {
                let health = if status.running_tasks > 0 {
                    ServiceHealth::Healthy
                } else if status.restart_count > 0 {
                    ServiceHealth::Unhealthy
                } else {
                    ServiceHealth::Starting
                };
                if let Err(err) = repo
                    .update_service_health(deployment_id, health, status.restart_count)
                    .await
                {
                    warn!(error = %err, "could not record service health");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "service status lookup failed"),
        }
    }

    pub async fn list_by_environment(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> Result<Vec<DeploymentResponse>, Error> {
        // Ownership first; foreign envs are indistinguishable from missing.
        let _env = self
            .store
            .environments()
            .get_owned(user_id, env_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        let deployments = self.store.deployments().list_for_env(env_id).await?;

        let mut responses = Vec::with_capacity(deployments.len());
        for deployment in deployments {
            responses.push(self.to_response(deployment).await?);
        }

        Ok(responses)
    }

    pub async fn get_logs(
        &self,
        user_id: &str,
        deployment_id: &str,
        tail: u32,
    ) -> Result<String, Error> {
        let deployment = self
            .store
            .deployments()
            .get_owned(user_id, deployment_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        let service_name = match self.store.deployments().get_service(deployment_id).await? {
            Some(service) => service.name,
            None => {
                let env = self
                    .store
                    .environments()
                    .get(&deployment.env_id)
                    .await?
                    .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;
                names::service_name(&env.name, &deployment.job_id)
            }
        };

        let bytes = self.driver.service_logs(&service_name, tail).await?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Tear one deployment down: the driver service (absent is success),
    /// its volumes unless preserved (absent or in-use are warnings), then
    /// the row itself; the 1:1 service row cascades.
    #[instrument(skip(self))]
    pub async fn delete(
        &self,
        user_id: &str,
        deployment_id: &str,
        preserve_volumes: bool,
    ) -> Result<(), Error> {
        let deployment = self
            .store
            .deployments()
            .get_owned(user_id, deployment_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        let env = self
            .store
            .environments()
            .get(&deployment.env_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        if deployment.status == DeploymentStatus::Running {
            self.bus.publish(Event::DeploymentStopped {
                deployment_id: deployment.deployment_id.clone(),
                job_id: deployment.job_id.clone(),
                user_id: user_id.to_string(),
                env_name: env.name.clone(),
            });
        }

        let service_name = names::service_name(&env.name, &deployment.job_id);
        self.driver.remove_service(&service_name).await?;

        if !preserve_volumes {
            for volume in &deployment.volumes {
                // Rows that never reached the volume step still carry
                // logical names; expand those on the fly.
                let name = if volume.name.starts_with("vol_") {
                    volume.name.clone()
                } else {
                    names::volume_name(&env.name, &volume.name)
                };
                if let Err(err) = self.driver.remove_volume(&name).await {
                    warn!(error = %err, volume = %name, "volume removal failed");
                }
            }
        }

        self.store.deployments().delete(deployment_id).await?;

        Ok(())
    }

    async fn active_owned_env(&self, user_id: &str, env_id: &str) -> Result<Environment, Error> {
        let env = self
            .store
            .environments()
            .get_owned(user_id, env_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        if env.status != EnvironmentStatus::Active {
            return Err(Error::conflict("environment is not active"));
        }

        Ok(env)
    }

    async fn to_response(&self, deployment: Deployment) -> Result<DeploymentResponse, Error> {
        let service = self
            .store
            .deployments()
            .get_service(&deployment.deployment_id)
            .await?;
        let env = self.store.environments().get(&deployment.env_id).await?;

        Ok(to_response(deployment, service, env))
    }
}

fn to_response(
    deployment: Deployment,
    service: Option<ServiceRecord>,
    env: Option<Environment>,
) -> DeploymentResponse {
    DeploymentResponse {
        id: deployment.deployment_id,
        job_id: deployment.job_id,
        image: deployment.image,
        tag: deployment.tag,
        replicas: deployment.replicas.max(0) as u64,
        ports: deployment.ports,
        volumes: deployment.volumes,
        status: deployment.status,
        error_message: deployment.error_message,
        started_at: deployment.started_at,
        completed_at: deployment.completed_at,
        current_version: deployment.current_version,
        git_url: deployment.git_url,
        git_branch: deployment.git_branch,
        created_at: deployment.created_at,
        service: service.map(|service| ServiceResponse {
            name: service.name,
            status: service.status,
            health: service.health,
            restart_count: service.restart_count,
        }),
        environment: env.map(|env| DeploymentEnvironmentSummary {
            id: env.env_id,
            name: env.name,
            status: env.status,
            is_public: env.is_public,
        }),
    }
}
