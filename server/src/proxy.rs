//! Env-var contract of the shared TLS reverse proxy.
//!
//! The proxy container watches the Docker socket and configures routes and
//! certificates from these variables on the services it can reach; this
//! process only attaches it to overlay networks and stamps the variables.

use crate::persistence::{Deployment, Environment};

pub const VIRTUAL_HOST: &str = "VIRTUAL_HOST";
pub const VIRTUAL_PORT: &str = "VIRTUAL_PORT";
pub const LETSENCRYPT_HOST: &str = "LETSENCRYPT_HOST";
pub const LETSENCRYPT_EMAIL: &str = "LETSENCRYPT_EMAIL";
pub const LETSENCRYPT_TEST: &str = "LETSENCRYPT_TEST";

/// ACME-side knobs, owned by configuration and injected wherever proxy env
/// vars are computed.
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    pub letsencrypt_email: Option<String>,
    /// Ask the companion for staging certificates.
    pub letsencrypt_staging: bool,
}

/// The proxy env pairs for a deployment in a public environment, or `None`
/// when the environment is private. A per-deployment `virtual_host`
/// override wins over the environment's domain.
pub fn proxy_env(
    env: &Environment,
    deployment: &Deployment,
    config: &ProxyConfig,
) -> Option<Vec<(String, String)>> {
    if !env.is_public {
        return None;
    }
    let domain = deployment
        .virtual_host
        .as_deref()
        .or(env.public_domain.as_deref())?;

    let mut pairs = vec![
        (VIRTUAL_HOST.to_string(), domain.to_string()),
        (LETSENCRYPT_HOST.to_string(), domain.to_string()),
    ];
    if let Some(email) = config.letsencrypt_email.as_deref() {
        pairs.push((LETSENCRYPT_EMAIL.to_string(), email.to_string()));
    }
    if config.letsencrypt_staging {
        pairs.push((LETSENCRYPT_TEST.to_string(), "true".to_string()));
    }
    if let Some(port) = deployment.virtual_port {
        pairs.push((VIRTUAL_PORT.to_string(), port.to_string()));
    }

    Some(pairs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;
    use runway_common::models::deployment::DeploymentStatus;
    use runway_common::models::environment::EnvironmentStatus;

    use super::*;

    fn environment(public: bool) -> Environment {
        Environment {
            env_id: "e1".into(),
            user_id: "u1".into(),
            name: "demo".into(),
            overlay_name: "overlay_env_demo_1".into(),
            driver_network_id: None,
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
            replicas: 1,
            ports: Vec::new(),
            env_vars: HashMap::new(),
            volumes: Vec::new(),
            virtual_host: None,
            virtual_port: None,
            healthcheck: None,
            cpu_limit: None,
            memory_limit_mb: None,
            status: DeploymentStatus::Running,
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

    #[test]
    fn private_environment_gets_nothing() {
        assert!(proxy_env(&environment(false), &deployment(), &ProxyConfig::default()).is_none());
    }

    #[test]
    fn public_environment_sets_host_pair() {
        let config = ProxyConfig {
            letsencrypt_email: Some("ops@example.com".to_string()),
            letsencrypt_staging: false,
        };
        let pairs = proxy_env(&environment(true), &deployment(), &config).unwrap();

        assert!(pairs.contains(&("VIRTUAL_HOST".into(), "app.example.com".into())));
        assert!(pairs.contains(&("LETSENCRYPT_HOST".into(), "app.example.com".into())));
        assert!(pairs.contains(&("LETSENCRYPT_EMAIL".into(), "ops@example.com".into())));
        assert!(!pairs.iter().any(|(k, _)| k == "LETSENCRYPT_TEST"));
    }

    #[test]
    fn staging_adds_the_test_flag() {
        let config = ProxyConfig {
            letsencrypt_email: None,
            letsencrypt_staging: true,
        };
        let pairs = proxy_env(&environment(true), &deployment(), &config).unwrap();

        assert!(pairs.contains(&("LETSENCRYPT_TEST".into(), "true".into())));
    }

    #[test]
    fn per_deployment_override_wins() {
        let mut dep = deployment();
        dep.virtual_host = Some("api.example.com".into());
        dep.virtual_port = Some(3000);

        let pairs = proxy_env(&environment(true), &dep, &ProxyConfig::default()).unwrap();
        assert!(pairs.contains(&("VIRTUAL_HOST".into(), "api.example.com".into())));
        assert!(pairs.contains(&("VIRTUAL_PORT".into(), "3000".into())));
    }
}
