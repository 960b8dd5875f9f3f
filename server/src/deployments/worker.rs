//! The asynchronous half of the pipeline: a bounded pool of workers
//! consuming typed messages from the job queue.
//!
//! A worker's contract is "eventually writes a terminal row state", never
//! "returns a value": every step failure is captured into
//! `status = FAILED` + `error_message` and a `deployment.failed` event, and
//! nothing propagates past the worker boundary. Transitions inside one item
//! are serial; there is no ordering across items.

use std::sync::Arc;

use chrono::Utc;
use runway_common::models::deployment::{
    DeploymentStatus, ServiceHealth, ServiceStatus, VolumeSpec,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::buildfile::{self, GitBuildSpec};
use super::names;
use crate::docker::{managed_labels, DockerOps, LABEL_DEPLOYMENT_ID, LABEL_ENV_ID};
use crate::error::{Error, ErrorKind};
use crate::events::{Event, EventBus};
use crate::persistence::{new_id, Deployment, Environment, Persistence, ServiceRecord};
use crate::proxy::ProxyConfig;

#[derive(Debug, Clone)]
pub enum WorkKind {
    Registry,
    Git(GitBuildSpec),
}

/// The typed message the creating request hands to the pool.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub deployment_id: String,
    pub kind: WorkKind,
    pub overlay_name: String,
}

/// Everything a worker needs besides the queue.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Persistence,
    pub driver: Arc<dyn DockerOps>,
    pub bus: EventBus,
    pub proxy_config: ProxyConfig,
}

/// Start `count` workers sharing one receiving end of the queue. The tasks
/// run until every sender is dropped.
pub fn spawn_workers(
    count: usize,
    receiver: mpsc::Receiver<WorkItem>,
    ctx: WorkerContext,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));

    (0..count.max(1))
        .map(|index| {
            let receiver = Arc::clone(&receiver);
            let worker = Worker {
                index,
                ctx: ctx.clone(),
            };
            tokio::spawn(async move {
                loop {
                    let item = { receiver.lock().await.recv().await };
                    let Some(item) = item else { break };
                    worker.process(item).await;
                }
                info!(worker = worker.index, "deployment worker shutting down");
            })
        })
        .collect()
}

struct Worker {
    index: usize,
    ctx: WorkerContext,
}

impl Worker {
    /// Run one item to a terminal row state. Never returns an error.
    #[instrument(skip(self, item), fields(worker = self.index, deployment = %item.deployment_id))]
    async fn process(&self, item: WorkItem) {
        let deployment = match self.ctx.store.deployments().get(&item.deployment_id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                warn!("queued deployment row vanished, skipping");
                return;
            }
            Err(err) => {
                error!(error = %err, "could not load queued deployment");
                return;
            }
        };

        if deployment.status != DeploymentStatus::Pending {
            warn!(status = %deployment.status, "queued deployment not pending, skipping");
            return;
        }

        let env = match self.ctx.store.environments().get(&deployment.env_id).await {
            Ok(Some(env)) => env,
            Ok(None) | Err(_) => {
                self.fail(&deployment, "environment disappeared before the worker ran")
                    .await;
                return;
            }
        };

        // The message pins the overlay the job was created against; if the
        // environment was torn down and rebuilt in between, this job's
        // desired state no longer describes anything real.
        if env.overlay_name != item.overlay_name {
            self.fail(&deployment, "environment changed while the job was queued")
                .await;
            return;
        }

        if let Err(err) = self.advance(&deployment, &env, &item.kind).await {
            self.fail(&deployment, &err.to_string()).await;
        }
    }

    /// The happy path; the first error anywhere aborts the pipeline.
    async fn advance(
        &self,
        deployment: &Deployment,
        env: &Environment,
        kind: &WorkKind,
    ) -> Result<(), Error> {
        let repo = self.ctx.store.deployments();

        // Phase one: get the image onto the node, by pull or by build.
        let first_status = match kind {
            WorkKind::Registry => DeploymentStatus::PullingImage,
            WorkKind::Git(_) => DeploymentStatus::BuildingImage,
        };
        repo.mark_started(&deployment.deployment_id, first_status, Utc::now())
            .await?;
        self.ctx.bus.publish(Event::DeploymentStarted {
            deployment_id: deployment.deployment_id.clone(),
            job_id: deployment.job_id.clone(),
            user_id: env.user_id.clone(),
            env_name: env.name.clone(),
        });

        match kind {
            WorkKind::Registry => {
                self.ctx
                    .driver
                    .pull_image(&deployment.image, &deployment.tag)
                    .await
                    .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            }
            WorkKind::Git(build) => {
                let dockerfile = buildfile::generate_dockerfile(build);
                let context = buildfile::build_context(&dockerfile)
                    .map_err(|err| Error::source(ErrorKind::Internal, err))?;
                self.ctx
                    .driver
                    .build_image(context, &deployment.image_ref())
                    .await
                    .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            }
        }

        // Phase two: managed volumes, rewritten to their expanded names.
        repo.set_status(&deployment.deployment_id, DeploymentStatus::CreatingVolumes)
            .await?;

        let mut expanded = Vec::with_capacity(deployment.volumes.len());
        for volume in &deployment.volumes {
            let name = names::volume_name(&env.name, &volume.name);
            self.ctx
                .driver
                .create_volume(
                    &name,
                    managed_labels([
                        (LABEL_ENV_ID, env.env_id.clone()),
                        (LABEL_DEPLOYMENT_ID, deployment.deployment_id.clone()),
                    ]),
                )
                .await
                .map_err(|err| Error::source(ErrorKind::Internal, err))?;
            expanded.push(VolumeSpec {
                name,
                mount_path: volume.mount_path.clone(),
            });
        }
        repo.update_volumes(&deployment.deployment_id, &expanded)
            .await?;

        // Phase three: realise the service on the env's overlay.
        repo.set_status(
            &deployment.deployment_id,
            DeploymentStatus::StartingContainers,
        )
        .await?;

        let mut desired = deployment.clone();
        desired.volumes = expanded;
        let request = super::build_service_request(&desired, env, &self.ctx.proxy_config);
        let service_name = request.name.clone();

        let driver_service_id = self
            .ctx
            .driver
            .create_service(request)
            .await
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;

        repo.insert_service(&ServiceRecord {
            service_id: new_id(),
            deployment_id: deployment.deployment_id.clone(),
            driver_service_id: Some(driver_service_id),
            name: service_name,
            status: ServiceStatus::Running,
            health: ServiceHealth::Starting,
            restart_count: 0,
            created_at: Utc::now(),
        })
        .await?;

        repo.mark_running(&deployment.deployment_id, Utc::now())
            .await?;
        self.ctx.bus.publish(Event::DeploymentSucceeded {
            deployment_id: deployment.deployment_id.clone(),
            job_id: deployment.job_id.clone(),
            user_id: env.user_id.clone(),
            env_name: env.name.clone(),
        });

        info!(job = %deployment.job_id, "deployment running");
        Ok(())
    }

    /// Terminal failure: record it, emit the event, move on. Partial
    /// volumes are left for the operator, deliberately.
    async fn fail(&self, deployment: &Deployment, message: &str) {
        error!(job = %deployment.job_id, reason = message, "deployment failed");

        if let Err(err) = self
            .ctx
            .store
            .deployments()
            .mark_failed(&deployment.deployment_id, message, Utc::now())
            .await
        {
            error!(error = %err, "could not record deployment failure");
        }

        let env = self
            .ctx
            .store
            .environments()
            .get(&deployment.env_id)
            .await
            .ok()
            .flatten();

        self.ctx.bus.publish(Event::DeploymentFailed {
            deployment_id: deployment.deployment_id.clone(),
            job_id: deployment.job_id.clone(),
            user_id: env.as_ref().map(|env| env.user_id.clone()).unwrap_or_default(),
            env_name: env.map(|env| env.name).unwrap_or_default(),
            message: message.to_string(),
        });
    }
}
