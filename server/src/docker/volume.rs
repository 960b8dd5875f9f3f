//! Volume domain — managed volumes with create/remove normalization.

use std::collections::HashMap;

use bollard::models::VolumeCreateRequest;
use tracing::{debug, warn};

use super::{response_status, DockerDriver, DockerError, VolumeRemoval};

impl DockerDriver {
    pub(super) async fn create_volume_inner(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), DockerError> {
        let config = VolumeCreateRequest {
            name: Some(name.to_string()),
            driver: Some("local".to_string()),
            labels: Some(labels),
            ..Default::default()
        };

        match self.client().create_volume(config).await {
            Ok(_) => Ok(()),
            // Already exists with a different spec: for our purposes the
            // volume is there, which is what was asked for.
            Err(err) if response_status(&err) == Some(409) => {
                debug!(volume = name, "volume already exists");
                Ok(())
            }
            Err(err) => Err(DockerError::from(err)),
        }
    }

    pub(super) async fn remove_volume_inner(
        &self,
        name: &str,
    ) -> Result<VolumeRemoval, DockerError> {
        match self
            .client()
            .remove_volume(name, None::<bollard::query_parameters::RemoveVolumeOptions>)
            .await
        {
            Ok(()) => Ok(VolumeRemoval::Removed),
            Err(err) if response_status(&err) == Some(404) => Ok(VolumeRemoval::Absent),
            Err(err) if response_status(&err) == Some(409) => {
                warn!(volume = name, "volume still in use, leaving it behind");
                Ok(VolumeRemoval::InUse)
            }
            Err(err) => Err(DockerError::from(err)),
        }
    }

    pub(super) async fn list_volumes_by_label_inner(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, DockerError> {
        let filters: HashMap<String, Vec<String>> = HashMap::from([(
            "label".to_string(),
            vec![format!("{key}={value}")],
        )]);
        let options = bollard::query_parameters::ListVolumesOptionsBuilder::default()
            .filters(&filters)
            .build();

        let response = self.client().list_volumes(Some(options)).await?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }
}
