//! Environment lifecycle: per-tenant overlay networks, public exposure
//! through the shared reverse proxy, and cascading teardown of everything
//! an environment owns.

use std::sync::Arc;

use chrono::Utc;
use runway_common::models::environment::{
    valid_environment_name, valid_public_domain, EnvironmentStatus,
};
use tracing::{debug, instrument, warn};

use crate::deployments::names;
use crate::docker::{managed_labels, DockerOps, LABEL_ENV_ID, LABEL_USER_ID};
use crate::error::{Error, ErrorKind};
use crate::events::{Event, EventBus};
use crate::persistence::{new_id, Environment, Persistence};
use crate::proxy::{self, ProxyConfig};

#[derive(Clone)]
pub struct EnvironmentService {
    store: Persistence,
    driver: Arc<dyn DockerOps>,
    bus: EventBus,
    /// Name of the shared reverse-proxy container.
    proxy_container: String,
    proxy_config: ProxyConfig,
}

impl EnvironmentService {
    pub fn new(
        store: Persistence,
        driver: Arc<dyn DockerOps>,
        bus: EventBus,
        proxy_container: String,
        proxy_config: ProxyConfig,
    ) -> Self {
        Self {
            store,
            driver,
            bus,
            proxy_container,
            proxy_config,
        }
    }

    #[instrument(skip(self))]
    pub async fn create_environment(
        &self,
        user_id: &str,
        name: &str,
    ) -> Result<Environment, Error> {
        if !valid_environment_name(name) {
            return Err(Error::bad_request(
                "environment names are 1-32 characters of [A-Za-z0-9_-]",
            ));
        }

        let repo = self.store.environments();
        if repo.name_in_use(user_id, name).await? {
            return Err(Error::conflict("an environment with this name already exists"));
        }

        // The epoch suffix keeps overlay names globally unique even across
        // rapid delete/recreate cycles of the same logical name.
        let env = Environment {
            env_id: new_id(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            overlay_name: names::overlay_name(name, Utc::now().timestamp_millis()),
            driver_network_id: None,
            status: EnvironmentStatus::Creating,
            is_public: false,
            public_domain: None,
            error_message: None,
            created_at: Utc::now(),
        };
        repo.insert(&env).await?;

        let labels = managed_labels([
            (LABEL_USER_ID, user_id.to_string()),
            (LABEL_ENV_ID, env.env_id.clone()),
        ]);
        match self
            .driver
            .create_overlay_network(&env.overlay_name, labels)
            .await
        {
            Ok(network_id) => {
                repo.mark_active(&env.env_id, &network_id).await?;
                self.bus.publish(Event::EnvironmentActive {
                    env_id: env.env_id.clone(),
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                });

                repo.get(&env.env_id)
                    .await?
                    .ok_or_else(|| Error::from_kind(ErrorKind::Internal))
            }
            Err(err) => {
                let message = err.to_string();
                repo.mark_error(&env.env_id, &message).await?;
                self.bus.publish(Event::EnvironmentError {
                    env_id: env.env_id.clone(),
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                    message,
                });

                Err(Error::source(ErrorKind::Internal, err))
            }
        }
    }

    pub async fn get_environment(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> Result<Environment, Error> {
        self.store
            .environments()
            .get_owned(user_id, env_id)
            .await?
            // A finished delete reads as gone.
            .filter(|env| env.status != EnvironmentStatus::Deleted)
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))
    }

    pub async fn list_environments(&self, user_id: &str) -> Result<Vec<Environment>, Error> {
        Ok(self.store.environments().list_for_user(user_id).await?)
    }

    /// Cascading teardown: child services, labelled volumes, then the
    /// overlay itself. Absent resources are fine; the proxy detaches by
    /// itself when the network goes. Rejected while a delete is already in
    /// flight or done.
    #[instrument(skip(self))]
    pub async fn delete_environment(&self, user_id: &str, env_id: &str) -> Result<(), Error> {
        let repo = self.store.environments();
        let env = repo
            .get_owned(user_id, env_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        if matches!(
            env.status,
            EnvironmentStatus::Deleting | EnvironmentStatus::Deleted
        ) {
            return Err(Error::conflict("environment is already being deleted"));
        }

        repo.set_status(env_id, EnvironmentStatus::Deleting).await?;

        match self.teardown(&env).await {
            Ok(()) => {
                repo.set_status(env_id, EnvironmentStatus::Deleted).await?;
                self.bus.publish(Event::EnvironmentDeleted {
                    env_id: env_id.to_string(),
                    user_id: user_id.to_string(),
                    name: env.name,
                });
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                repo.mark_error(env_id, &message).await?;
                self.bus.publish(Event::EnvironmentError {
                    env_id: env_id.to_string(),
                    user_id: user_id.to_string(),
                    name: env.name,
                    message,
                });
                Err(err)
            }
        }
    }

    async fn teardown(&self, env: &Environment) -> Result<(), Error> {
        let deployments = self.store.deployments();

        for deployment in deployments.list_for_env(&env.env_id).await? {
            let service_name = names::service_name(&env.name, &deployment.job_id);
            self.driver.remove_service(&service_name).await?;
            deployments.delete(&deployment.deployment_id).await?;
        }

        for volume in self
            .driver
            .list_volumes_by_label(LABEL_ENV_ID, &env.env_id)
            .await?
        {
            // In-use is already downgraded to a warning by the driver.
            self.driver.remove_volume(&volume).await?;
        }

        self.driver.delete_network(&env.overlay_name).await?;

        Ok(())
    }

    /// Expose an environment at a public domain. Atomic at the row level;
    /// proxy attachment and the env patch of running services are
    /// best-effort.
    #[instrument(skip(self))]
    pub async fn make_public(
        &self,
        user_id: &str,
        env_id: &str,
        domain: &str,
    ) -> Result<Environment, Error> {
        let repo = self.store.environments();
        let env = repo
            .get_owned(user_id, env_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::NotFound))?;

        if env.status != EnvironmentStatus::Active {
            return Err(Error::conflict("environment is not active"));
        }
        if env.is_public {
            return Err(Error::conflict("environment is already public"));
        }
        if !valid_public_domain(domain) {
            return Err(Error::bad_request("malformed domain"));
        }
        if repo.domain_in_use(domain).await? {
            return Err(Error::conflict("domain is already in use"));
        }

        // "Already connected" is success; anything else is logged and the
        // proxy picks the network up on its next sweep.
        if let Err(err) = self
            .driver
            .connect_container(&env.overlay_name, &self.proxy_container)
            .await
        {
            warn!(error = %err, network = %env.overlay_name, "proxy attach failed");
        }

        repo.make_public(env_id, domain).await?;
        let env = repo
            .get(env_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::Internal))?;

        self.patch_running_deployments(&env).await?;

        self.bus.publish(Event::EnvironmentMadePublic {
            env_id: env_id.to_string(),
            user_id: user_id.to_string(),
            name: env.name.clone(),
            domain: domain.to_string(),
        });

        Ok(env)
    }

    /// Stamp proxy env vars into the specs of running services without
    /// recreating them.
    async fn patch_running_deployments(&self, env: &Environment) -> Result<(), Error> {
        let deployments = self.store.deployments();

        for deployment in deployments.list_for_env(&env.env_id).await? {
            let Some(pairs) = proxy::proxy_env(env, &deployment, &self.proxy_config) else {
                continue;
            };
            if deployment.status != runway_common::models::deployment::DeploymentStatus::Running {
                continue;
            }

            let service_name = names::service_name(&env.name, &deployment.job_id);
            match self.driver.update_service_env(&service_name, pairs).await {
                Ok(()) => {
                    debug!(service = %service_name, "patched proxy env");
                    let _ = deployments
                        .record_update(
                            &deployment.deployment_id,
                            "proxy-env-patch",
                            deployment.current_version,
                            deployment.current_version,
                            serde_json::json!({
                                "virtualHost": env.public_domain,
                            }),
                        )
                        .await;
                }
                Err(err) => {
                    warn!(error = %err, service = %service_name, "proxy env patch failed");
                }
            }
        }

        Ok(())
    }
}
