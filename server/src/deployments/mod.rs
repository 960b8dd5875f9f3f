//! The deployment engine: request validation and job creation on the
//! synchronous side, an asynchronous worker pipeline that drives the Swarm,
//! and the shared service-spec assembly both the workers and the recovery
//! supervisor use.

pub mod buildfile;
pub mod engine;
pub mod names;
pub mod worker;

pub use buildfile::GitBuildSpec;
pub use engine::DeploymentEngine;
pub use worker::{spawn_workers, WorkItem, WorkKind, WorkerContext};

use crate::docker::{
    managed_labels, MountRequest, ServiceRequest, LABEL_DEPLOYMENT_ID, LABEL_ENV_ID,
};
use crate::persistence::{Deployment, Environment};
use crate::proxy::{self, ProxyConfig};

/// Assemble the driver-level service request for a deployment from its
/// persisted desired state. Proxy env vars are merged over user env when
/// the environment is public; user-provided values never override them.
pub fn build_service_request(
    deployment: &Deployment,
    env: &Environment,
    proxy_config: &ProxyConfig,
) -> ServiceRequest {
    let mut env_pairs: Vec<(String, String)> = deployment
        .env_vars
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env_pairs.sort();

    if let Some(proxy_pairs) = proxy::proxy_env(env, deployment, proxy_config) {
        for (key, value) in proxy_pairs {
            env_pairs.retain(|(k, _)| k != &key);
            env_pairs.push((key, value));
        }
    }

    ServiceRequest {
        name: names::service_name(&env.name, &deployment.job_id),
        image: deployment.image_ref(),
        replicas: deployment.replicas.max(0) as u64,
        network: env.overlay_name.clone(),
        env: env_pairs
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect(),
        labels: managed_labels([
            (LABEL_ENV_ID, env.env_id.clone()),
            (LABEL_DEPLOYMENT_ID, deployment.deployment_id.clone()),
        ]),
        mounts: deployment
            .volumes
            .iter()
            .map(|volume| MountRequest {
                volume: volume.name.clone(),
                target: volume.mount_path.clone(),
            })
            .collect(),
        ports: deployment.ports.clone(),
        healthcheck: deployment.healthcheck.clone(),
        cpu_limit: deployment.cpu_limit,
        memory_limit_mb: deployment.memory_limit_mb,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use runway_common::models::deployment::{DeploymentStatus, PortSpec, VolumeSpec};
    use runway_common::models::environment::EnvironmentStatus;

    use super::*;
    use crate::docker::MANAGED_LABEL;

    fn environment(public: bool) -> Environment {
        Environment {
            env_id: "e1".into(),
            user_id: "u1".into(),
            name: "demo".into(),
            overlay_name: "overlay_env_demo_1700000000000".into(),
            driver_network_id: Some("n1".into()),
            status: EnvironmentStatus::Active,
            is_public: public,
            public_domain: public.then(|| "app.example.com".to_string()),
            error_message: None,
            created_at: Utc::now(),
        }
    }

    fn deployment() -> Deployment {
        Deployment {
            deployment_id: "d1".into(),
            env_id: "e1".into(),
            job_id: "abcdefghijklmnop".into(),
            image: "nginx".into(),
            tag: "alpine".into(),
            replicas: 2,
            ports: vec![PortSpec {
                container: 80,
                host: 8080,
            }],
            env_vars: HashMap::from([
                ("FOO".to_string(), "bar".to_string()),
                // A user value that must lose against the proxy's.
                ("VIRTUAL_HOST".to_string(), "spoof.example.com".to_string()),
            ]),
            volumes: vec![VolumeSpec {
                name: "vol_demo_data".into(),
                mount_path: "/data".into(),
            }],
            virtual_host: None,
            virtual_port: None,
            healthcheck: None,
            cpu_limit: None,
            memory_limit_mb: None,
            status: DeploymentStatus::Pending,
            error_message: None,
            started_at: None,
            completed_at: None,
            current_version: 1,
            git_url: None,
            git_branch: None,
            git_commit_sha: None,
            created_at: Utc::now(),
        }
    }

    fn email_config() -> ProxyConfig {
        ProxyConfig {
            letsencrypt_email: Some("ops@example.com".to_string()),
            letsencrypt_staging: false,
        }
    }

    #[test]
    fn request_reflects_desired_state() {
        let request = build_service_request(&deployment(), &environment(false), &email_config());

        assert_eq!(request.name, "job_demo_abcdefghijklmnop");
        assert_eq!(request.image, "nginx:alpine");
        assert_eq!(request.replicas, 2);
        assert_eq!(request.network, "overlay_env_demo_1700000000000");
        assert!(request.env.contains(&"FOO=bar".to_string()));
        assert_eq!(request.mounts[0].volume, "vol_demo_data");
        assert_eq!(request.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(request.labels.get(LABEL_ENV_ID).map(String::as_str), Some("e1"));
    }

    #[test]
    fn private_env_gets_no_proxy_vars_even_if_user_tries() {
        let request = build_service_request(&deployment(), &environment(false), &email_config());
        // The user-provided VIRTUAL_HOST passes through untouched on a
        // private network; the proxy is not attached there anyway.
        assert!(request
            .env
            .contains(&"VIRTUAL_HOST=spoof.example.com".to_string()));
    }

    #[test]
    fn public_env_proxy_vars_win_over_user_values() {
        let request =
            build_service_request(&deployment(), &environment(true), &email_config());

        assert!(request
            .env
            .contains(&"VIRTUAL_HOST=app.example.com".to_string()));
        assert!(!request
            .env
            .contains(&"VIRTUAL_HOST=spoof.example.com".to_string()));
        assert!(request
            .env
            .contains(&"LETSENCRYPT_HOST=app.example.com".to_string()));
        assert!(request
            .env
            .contains(&"LETSENCRYPT_EMAIL=ops@example.com".to_string()));
    }
}
