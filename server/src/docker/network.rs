//! Network domain — overlay create/find/delete, proxy attach/detach.

use std::collections::HashMap;

use bollard::models::{NetworkConnectRequest, NetworkCreateRequest, NetworkDisconnectRequest};
use tracing::{debug, info};

use super::{response_status, DockerDriver, DockerError};

impl DockerDriver {
    pub(super) async fn ensure_swarm_inner(
        &self,
        advertise_addr: Option<&str>,
    ) -> Result<(), DockerError> {
        match self.client().inspect_swarm().await {
            Ok(_) => Ok(()),
            // 503: in a swarm but a worker; managing services needs a manager.
            Err(err) if response_status(&err) == Some(503) => Err(DockerError::NotSwarmManager),
            // 406: not in a swarm at all. Initialise one when we are allowed to.
            Err(err) if response_status(&err) == Some(406) => {
                let Some(advertise_addr) = advertise_addr else {
                    return Err(DockerError::NotSwarmManager);
                };

                let request = bollard::models::SwarmInitRequest {
                    listen_addr: Some("0.0.0.0:2377".to_string()),
                    advertise_addr: Some(advertise_addr.to_string()),
                    ..Default::default()
                };
                let node_id = self.client().init_swarm(request).await?;
                info!(%node_id, %advertise_addr, "initialised single-node swarm");
                Ok(())
            }
            Err(err) => Err(DockerError::from(err)),
        }
    }

    /// Create an attachable overlay network. Returns the driver network id.
    pub(super) async fn create_overlay_network_inner(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String, DockerError> {
        let config = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("overlay".to_string()),
            attachable: Some(true),
            labels: Some(labels),
            ..Default::default()
        };

        let response = self.client().create_network(config).await?;
        debug!(network = name, id = %response.id, "created overlay network");

        Ok(response.id)
    }

    pub(super) async fn find_network_inner(
        &self,
        name: &str,
    ) -> Result<Option<String>, DockerError> {
        match self
            .client()
            .inspect_network(
                name,
                None::<bollard::query_parameters::InspectNetworkOptions>,
            )
            .await
        {
            Ok(network) => Ok(network.id),
            Err(err) if response_status(&err) == Some(404) => Ok(None),
            Err(err) => Err(DockerError::from(err)),
        }
    }

    pub(super) async fn delete_network_inner(&self, name: &str) -> Result<(), DockerError> {
        match self.client().remove_network(name).await {
            Ok(()) => Ok(()),
            Err(err) if response_status(&err) == Some(404) => {
                debug!(network = name, "network already gone");
                Ok(())
            }
            Err(err) => Err(DockerError::from(err)),
        }
    }

    pub(super) async fn connect_container_inner(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), DockerError> {
        let config = NetworkConnectRequest {
            container: container.to_string(),
            ..Default::default()
        };

        match self.client().connect_network(network, config).await {
            Ok(()) => Ok(()),
            // The engine reports an existing endpoint as a conflict; for us
            // that is the desired state.
            Err(err) if already_connected(&err) => {
                debug!(network, container, "container already attached");
                Ok(())
            }
            Err(err) => Err(DockerError::from(err)),
        }
    }

    pub(super) async fn disconnect_container_inner(
        &self,
        network: &str,
        container: &str,
    ) -> Result<(), DockerError> {
        let config = NetworkDisconnectRequest {
            container: container.to_string(),
            force: Some(false),
        };

        match self.client().disconnect_network(network, config).await {
            Ok(()) => Ok(()),
            Err(err) if response_status(&err) == Some(404) => Ok(()),
            Err(err) => Err(DockerError::from(err)),
        }
    }
}

fn already_connected(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => {
            (matches!(*status_code, 403 | 409)
                && message.contains("already exists in network"))
                || message.contains("already attached")
        }
        _ => false,
    }
}
