use std::collections::HashMap;

use chrono::{DateTime, Utc};
use runway_common::models::deployment::{
    DeploymentStatus, HealthcheckSpec, PortSpec, ServiceHealth, ServiceStatus, VolumeSpec,
};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use super::{decode_enum, decode_json, new_id, Environment};
use crate::crypto::Encryptor;

/// Desired state of one workload. At most one [`ServiceRecord`] projects it
/// into the cluster.
#[derive(Clone, Debug)]
pub struct Deployment {
    pub deployment_id: String,
    pub env_id: String,
    pub job_id: String,
    pub image: String,
    pub tag: String,
    pub replicas: i64,
    pub ports: Vec<PortSpec>,
    pub env_vars: HashMap<String, String>,
    pub volumes: Vec<VolumeSpec>,
    pub virtual_host: Option<String>,
    pub virtual_port: Option<i64>,
    pub healthcheck: Option<HealthcheckSpec>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<i64>,
    pub status: DeploymentStatus,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_version: i64,
    pub git_url: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// The Swarm-service projection of a deployment (1:1).
#[derive(Clone, Debug)]
pub struct ServiceRecord {
    pub service_id: String,
    pub deployment_id: String,
    pub driver_service_id: Option<String>,
    pub name: String,
    pub status: ServiceStatus,
    pub health: ServiceHealth,
    pub restart_count: i64,
    pub created_at: DateTime<Utc>,
}

/// The desired-state snapshot appended to `deployment_versions` on every
/// create.
#[derive(Serialize)]
struct VersionSnapshot<'d> {
    image: &'d str,
    tag: &'d str,
    replicas: i64,
    ports: &'d [PortSpec],
    volumes: &'d [VolumeSpec],
    git_url: Option<&'d str>,
    git_branch: Option<&'d str>,
}

#[derive(Clone)]
pub struct DeploymentRepository {
    pool: SqlitePool,
    encryptor: Encryptor,
}

impl DeploymentRepository {
    pub(super) fn new(pool: SqlitePool, encryptor: Encryptor) -> Self {
        Self { pool, encryptor }
    }

    pub async fn insert(&self, deployment: &Deployment) -> Result<(), sqlx::Error> {
        let env_vars = self.seal_env_vars(&deployment.env_vars)?;
        let healthcheck = deployment
            .healthcheck
            .as_ref()
            .map(|hc| serde_json::to_string(hc).expect("healthcheck serializes"));

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO deployments \
             (deployment_id, env_id, job_id, image, tag, replicas, ports, env_vars, volumes, \
              virtual_host, virtual_port, healthcheck, cpu_limit, memory_limit_mb, status, \
              error_message, started_at, completed_at, current_version, git_url, git_branch, \
              git_commit_sha, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                     ?18, ?19, ?20, ?21, ?22, ?23)",
        )
        .bind(&deployment.deployment_id)
        .bind(&deployment.env_id)
        .bind(&deployment.job_id)
        .bind(&deployment.image)
        .bind(&deployment.tag)
        .bind(deployment.replicas)
        .bind(to_json(&deployment.ports))
        .bind(env_vars)
        .bind(to_json(&deployment.volumes))
        .bind(&deployment.virtual_host)
        .bind(deployment.virtual_port)
        .bind(healthcheck)
        .bind(deployment.cpu_limit)
        .bind(deployment.memory_limit_mb)
        .bind(deployment.status.to_string())
        .bind(&deployment.error_message)
        .bind(deployment.started_at)
        .bind(deployment.completed_at)
        .bind(deployment.current_version)
        .bind(&deployment.git_url)
        .bind(&deployment.git_branch)
        .bind(&deployment.git_commit_sha)
        .bind(deployment.created_at)
        .execute(&mut *tx)
        .await?;

        let snapshot = VersionSnapshot {
            image: &deployment.image,
            tag: &deployment.tag,
            replicas: deployment.replicas,
            ports: &deployment.ports,
            volumes: &deployment.volumes,
            git_url: deployment.git_url.as_deref(),
            git_branch: deployment.git_branch.as_deref(),
        };
        sqlx::query(
            "INSERT INTO deployment_versions (version_id, deployment_id, version, snapshot, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(new_id())
        .bind(&deployment.deployment_id)
        .bind(deployment.current_version)
        .bind(to_json(&snapshot))
        .bind(deployment.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }

    pub async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM deployments WHERE deployment_id = ?1")
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| self.row_to_deployment(row)).transpose()
    }

    pub async fn get_owned(
        &self,
        user_id: &str,
        deployment_id: &str,
    ) -> Result<Option<Deployment>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT d.* FROM deployments d \
             JOIN environments e ON e.env_id = d.env_id \
             WHERE d.deployment_id = ?1 AND e.user_id = ?2",
        )
        .bind(deployment_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_deployment(row)).transpose()
    }

    pub async fn get_by_job(
        &self,
        user_id: &str,
        job_id: &str,
    ) -> Result<Option<Deployment>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT d.* FROM deployments d \
             JOIN environments e ON e.env_id = d.env_id \
             WHERE d.job_id = ?1 AND e.user_id = ?2",
        )
        .bind(job_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| self.row_to_deployment(row)).transpose()
    }

    pub async fn list_for_env(&self, env_id: &str) -> Result<Vec<Deployment>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM deployments WHERE env_id = ?1 ORDER BY created_at DESC",
        )
        .bind(env_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| self.row_to_deployment(row))
            .collect()
    }

    /// Everything the recovery supervisor cares about: RUNNING rows joined
    /// with their environments.
    pub async fn list_running_with_env(
        &self,
    ) -> Result<Vec<(Deployment, Environment)>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT d.deployment_id FROM deployments d WHERE d.status = 'RUNNING'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("deployment_id")?;
            let Some(deployment) = self.get(&id).await? else {
                continue;
            };
            let env_row = sqlx::query("SELECT * FROM environments WHERE env_id = ?1")
                .bind(&deployment.env_id)
                .fetch_optional(&self.pool)
                .await?;
            if let Some(env_row) = env_row {
                out.push((deployment, super::environments::row_to_environment(env_row)?));
            }
        }

        Ok(out)
    }

    pub async fn set_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE deployments SET status = ?1 WHERE deployment_id = ?2")
            .bind(status.to_string())
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// First transition out of PENDING: stamp `started_at` alongside.
    pub async fn mark_started(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE deployments SET status = ?1, started_at = ?2 WHERE deployment_id = ?3",
        )
        .bind(status.to_string())
        .bind(now)
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_running(
        &self,
        deployment_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE deployments SET status = 'RUNNING', completed_at = ?1, error_message = NULL \
             WHERE deployment_id = ?2",
        )
        .bind(now)
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(
        &self,
        deployment_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE deployments SET status = 'FAILED', error_message = ?1, completed_at = ?2 \
             WHERE deployment_id = ?3",
        )
        .bind(message)
        .bind(now)
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist volume specs rewritten to their expanded driver names.
    pub async fn update_volumes(
        &self,
        deployment_id: &str,
        volumes: &[VolumeSpec],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE deployments SET volumes = ?1 WHERE deployment_id = ?2")
            .bind(to_json(&volumes))
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Hard delete; the service row, versions and update rows cascade.
    pub async fn delete(&self, deployment_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM deployments WHERE deployment_id = ?1")
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn insert_service(&self, service: &ServiceRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO services \
             (service_id, deployment_id, driver_service_id, name, status, health, restart_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (deployment_id) DO UPDATE SET \
               driver_service_id = excluded.driver_service_id, \
               name = excluded.name, \
               status = excluded.status, \
               health = excluded.health, \
               restart_count = excluded.restart_count",
        )
        .bind(&service.service_id)
        .bind(&service.deployment_id)
        .bind(&service.driver_service_id)
        .bind(&service.name)
        .bind(service.status.to_string())
        .bind(service.health.to_string())
        .bind(service.restart_count)
        .bind(service.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_service(
        &self,
        deployment_id: &str,
    ) -> Result<Option<ServiceRecord>, sqlx::Error> {
        sqlx::query("SELECT * FROM services WHERE deployment_id = ?1")
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_service)
            .transpose()
    }

    /// Refresh the observed side of the projection (the desired side never
    /// changes after creation).
    pub async fn update_service_health(
        &self,
        deployment_id: &str,
        health: ServiceHealth,
        restart_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE services SET health = ?1, restart_count = ?2 WHERE deployment_id = ?3",
        )
        .bind(health.to_string())
        .bind(restart_count)
        .bind(deployment_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recorded, never executed: the update history is a reserved extension
    /// point.
    pub async fn record_update(
        &self,
        deployment_id: &str,
        strategy: &str,
        from_version: i64,
        to_version: i64,
        changes: serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO deployment_updates \
             (update_id, deployment_id, strategy, from_version, to_version, status, changes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'RECORDED', ?6, ?7)",
        )
        .bind(new_id())
        .bind(deployment_id)
        .bind(strategy)
        .bind(from_version)
        .bind(to_version)
        .bind(changes.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_versions(&self, deployment_id: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM deployment_versions WHERE deployment_id = ?1",
        )
        .bind(deployment_id)
        .fetch_one(&self.pool)
        .await?;

        row.try_get("n")
    }

    fn seal_env_vars(&self, env_vars: &HashMap<String, String>) -> Result<String, sqlx::Error> {
        let plain = serde_json::to_string(env_vars).expect("env vars serialize");
        self.encryptor
            .seal(&plain)
            .map_err(|err| sqlx::Error::ColumnDecode {
                index: "env_vars".to_string(),
                source: Box::new(err),
            })
    }

    fn row_to_deployment(&self, row: sqlx::sqlite::SqliteRow) -> Result<Deployment, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let ports: String = row.try_get("ports")?;
        let volumes: String = row.try_get("volumes")?;
        let sealed_env: String = row.try_get("env_vars")?;
        let env_vars = self
            .encryptor
            .open(&sealed_env)
            .map_err(|err| sqlx::Error::ColumnDecode {
                index: "env_vars".to_string(),
                source: Box::new(err),
            })?;
        let healthcheck: Option<String> = row.try_get("healthcheck")?;

        Ok(Deployment {
            deployment_id: row.try_get("deployment_id")?,
            env_id: row.try_get("env_id")?,
            job_id: row.try_get("job_id")?,
            image: row.try_get("image")?,
            tag: row.try_get("tag")?,
            replicas: row.try_get("replicas")?,
            ports: decode_json("ports", &ports)?,
            env_vars: decode_json("env_vars", &env_vars)?,
            volumes: decode_json("volumes", &volumes)?,
            virtual_host: row.try_get("virtual_host")?,
            virtual_port: row.try_get("virtual_port")?,
            healthcheck: healthcheck
                .map(|hc| decode_json("healthcheck", &hc))
                .transpose()?,
            cpu_limit: row.try_get("cpu_limit")?,
            memory_limit_mb: row.try_get("memory_limit_mb")?,
            status: decode_enum("status", status)?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            current_version: row.try_get("current_version")?,
            git_url: row.try_get("git_url")?,
            git_branch: row.try_get("git_branch")?,
            git_commit_sha: row.try_get("git_commit_sha")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("value serializes")
}

fn row_to_service(row: sqlx::sqlite::SqliteRow) -> Result<ServiceRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let health: String = row.try_get("health")?;

    Ok(ServiceRecord {
        service_id: row.try_get("service_id")?,
        deployment_id: row.try_get("deployment_id")?,
        driver_service_id: row.try_get("driver_service_id")?,
        name: row.try_get("name")?,
        status: decode_enum("status", status)?,
        health: decode_enum("health", health)?,
        restart_count: row.try_get("restart_count")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use runway_common::models::environment::EnvironmentStatus;

    use super::*;
    use crate::persistence::{new_id, Persistence};

    async fn seed_env(store: &Persistence) -> Environment {
        let user = store.users().upsert_by_chat_id(1, None).await.unwrap();
        let env = Environment {
            env_id: new_id(),
            user_id: user.user_id,
            name: "demo".to_string(),
            overlay_name: "overlay_env_demo_1".to_string(),
            driver_network_id: None,
            status: EnvironmentStatus::Active,
            is_public: false,
            public_domain: None,
            error_message: None,
            created_at: Utc::now(),
        };
        store.environments().insert(&env).await.unwrap();
        env
    }

    fn deployment(env_id: &str, job_id: &str) -> Deployment {
        Deployment {
            deployment_id: new_id(),
            env_id: env_id.to_string(),
            job_id: job_id.to_string(),
            image: "nginx".to_string(),
            tag: "alpine".to_string(),
            replicas: 1,
            ports: vec![PortSpec {
                container: 80,
                host: 8080,
            }],
            env_vars: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            volumes: vec![VolumeSpec {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
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

    #[tokio::test]
    async fn round_trips_with_version_snapshot() {
        let store = Persistence::new_in_memory().await;
        let env = seed_env(&store).await;
        let repo = store.deployments();

        let dep = deployment(&env.env_id, "abcdefghijklmnop");
        repo.insert(&dep).await.unwrap();

        let loaded = repo.get(&dep.deployment_id).await.unwrap().unwrap();
        assert_eq!(loaded.image_ref(), "nginx:alpine");
        assert_eq!(loaded.env_vars.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(loaded.ports, dep.ports);
        assert_eq!(repo.count_versions(&dep.deployment_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ownership_joins_through_environment() {
        let store = Persistence::new_in_memory().await;
        let env = seed_env(&store).await;
        let stranger = store.users().upsert_by_chat_id(2, None).await.unwrap();
        let repo = store.deployments();

        let dep = deployment(&env.env_id, "abcdefghijklmnop");
        repo.insert(&dep).await.unwrap();

        assert!(repo
            .get_by_job(&env.user_id, &dep.job_id)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .get_by_job(&stranger.user_id, &dep.job_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_cascades_to_service_and_versions() {
        let store = Persistence::new_in_memory().await;
        let env = seed_env(&store).await;
        let repo = store.deployments();

        let dep = deployment(&env.env_id, "abcdefghijklmnop");
        repo.insert(&dep).await.unwrap();
        repo.insert_service(&ServiceRecord {
            service_id: new_id(),
            deployment_id: dep.deployment_id.clone(),
            driver_service_id: Some("svc1".to_string()),
            name: "job_demo_abcdefghijklmnop".to_string(),
            status: ServiceStatus::Running,
            health: ServiceHealth::Starting,
            restart_count: 0,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

        repo.delete(&dep.deployment_id).await.unwrap();
        assert!(repo.get(&dep.deployment_id).await.unwrap().is_none());
        assert!(repo.get_service(&dep.deployment_id).await.unwrap().is_none());
        assert_eq!(repo.count_versions(&dep.deployment_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn running_rows_surface_for_recovery() {
        let store = Persistence::new_in_memory().await;
        let env = seed_env(&store).await;
        let repo = store.deployments();

        let mut dep = deployment(&env.env_id, "abcdefghijklmnop");
        dep.status = DeploymentStatus::Running;
        repo.insert(&dep).await.unwrap();

        let running = repo.list_running_with_env().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].1.env_id, env.env_id);
    }
}
