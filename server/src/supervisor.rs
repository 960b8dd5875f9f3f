//! Boot-time reconciliation: every `RUNNING` row either has its service
//! live in the swarm, or gets it relaunched from persisted desired state,
//! or is flipped to `FAILED`. Runs once, before the handler surface opens,
//! and never lets one bad row block the rest.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::deployments::{build_service_request, names};
use crate::docker::{managed_labels, DockerOps, LABEL_ENV_ID, LABEL_USER_ID};
use crate::error::{Error, ErrorKind};
use crate::events::{Event, EventBus};
use crate::persistence::{Deployment, Environment, Persistence};
use crate::proxy::ProxyConfig;

const STORE_WAIT_ATTEMPTS: u32 = 10;
const STORE_WAIT_INITIAL: Duration = Duration::from_secs(1);
const STORE_WAIT_CAP: Duration = Duration::from_secs(10);

/// What one reconciliation pass did, for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub checked: usize,
    pub intact: usize,
    pub recovered: usize,
    pub failed: usize,
}

pub struct RecoverySupervisor {
    store: Persistence,
    driver: Arc<dyn DockerOps>,
    bus: EventBus,
    proxy_config: ProxyConfig,
}

impl RecoverySupervisor {
    pub fn new(
        store: Persistence,
        driver: Arc<dyn DockerOps>,
        bus: EventBus,
        proxy_config: ProxyConfig,
    ) -> Self {
        Self {
            store,
            driver,
            bus,
            proxy_config,
        }
    }

    /// Wait for the store to answer a ping, backing off 1 s doubling to a
    /// 10 s cap, at most [`STORE_WAIT_ATTEMPTS`] attempts.
    pub async fn wait_for_store(store: &Persistence) -> Result<(), Error> {
        let mut delay = STORE_WAIT_INITIAL;

        for attempt in 1..=STORE_WAIT_ATTEMPTS {
            match store.ping().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt == STORE_WAIT_ATTEMPTS => {
                    return Err(Error::source(ErrorKind::ServiceUnavailable, err));
                }
                Err(err) => {
                    warn!(attempt, error = %err, "store not ready, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(STORE_WAIT_CAP);
                }
            }
        }

        unreachable!("loop returns on the final attempt");
    }

    /// One full pass over the `RUNNING` rows.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<RecoveryReport, Error> {
        Self::wait_for_store(&self.store).await?;

        let running = self.store.deployments().list_running_with_env().await?;
        let mut report = RecoveryReport {
            checked: running.len(),
            ..Default::default()
        };

        for (deployment, env) in running {
            let service_name = names::service_name(&env.name, &deployment.job_id);

            match self.driver.get_service(&service_name).await {
                Ok(Some(_)) => {
                    report.intact += 1;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    // Can't even ask; leave the row alone rather than guess.
                    error!(error = %err, service = %service_name, "service lookup failed");
                    report.failed += 1;
                    continue;
                }
            }

            info!(service = %service_name, "service missing, relaunching");
            match self.relaunch(&deployment, &env).await {
                Ok(()) => {
                    report.recovered += 1;
                    self.bus.publish(Event::DeploymentRecovered {
                        deployment_id: deployment.deployment_id.clone(),
                        job_id: deployment.job_id.clone(),
                        user_id: env.user_id.clone(),
                        env_name: env.name.clone(),
                    });
                }
                Err(err) => {
                    report.failed += 1;
                    let message = err.to_string();
                    if let Err(err) = self
                        .store
                        .deployments()
                        .mark_failed(&deployment.deployment_id, &message, Utc::now())
                        .await
                    {
                        error!(error = %err, "could not record recovery failure");
                    }
                    self.bus.publish(Event::DeploymentRecoveryFailed {
                        deployment_id: deployment.deployment_id.clone(),
                        job_id: deployment.job_id.clone(),
                        user_id: env.user_id.clone(),
                        env_name: env.name.clone(),
                        message,
                    });
                }
            }
        }

        info!(
            checked = report.checked,
            intact = report.intact,
            recovered = report.recovered,
            failed = report.failed,
            "recovery pass complete"
        );

        Ok(report)
    }

    async fn relaunch(&self, deployment: &Deployment, env: &Environment) -> Result<(), Error> {
        // The overlay may have died with the node; recreate it first.
        if self.driver.find_network(&env.overlay_name).await?.is_none() {
            warn!(network = %env.overlay_name, "overlay missing, recreating");
            self.driver
                .create_overlay_network(
                    &env.overlay_name,
                    managed_labels([
                        (LABEL_USER_ID, env.user_id.clone()),
                        (LABEL_ENV_ID, env.env_id.clone()),
                    ]),
                )
                .await?;
        }

        let request = build_service_request(deployment, env, &self.proxy_config);
        self.driver.create_service(request).await?;

        Ok(())
    }
}
