use chrono::{DateTime, Utc};
use runway_common::models::environment::{EnvironmentResponse, EnvironmentStatus};
use sqlx::{Row, SqlitePool};

use super::decode_enum;

/// A tenant-private overlay network. `status = ACTIVE` implies a live
/// driver network with the persisted `overlay_name` exists.
#[derive(Clone, Debug)]
pub struct Environment {
    pub env_id: String,
    pub user_id: String,
    pub name: String,
    pub overlay_name: String,
    pub driver_network_id: Option<String>,
    pub status: EnvironmentStatus,
    pub is_public: bool,
    pub public_domain: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Environment> for EnvironmentResponse {
    fn from(env: Environment) -> Self {
        Self {
            id: env.env_id,
            name: env.name,
            overlay_name: env.overlay_name,
            status: env.status,
            is_public: env.is_public,
            public_domain: env.public_domain,
            error_message: env.error_message,
            created_at: env.created_at,
        }
    }
}

#[derive(Clone)]
pub struct EnvironmentRepository {
    pool: SqlitePool,
}

impl EnvironmentRepository {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, env: &Environment) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO environments \
             (env_id, user_id, name, overlay_name, driver_network_id, status, is_public, public_domain, error_message, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&env.env_id)
        .bind(&env.user_id)
        .bind(&env.name)
        .bind(&env.overlay_name)
        .bind(&env.driver_network_id)
        .bind(env.status.to_string())
        .bind(env.is_public)
        .bind(&env.public_domain)
        .bind(&env.error_message)
        .bind(env.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, env_id: &str) -> Result<Option<Environment>, sqlx::Error> {
        sqlx::query("SELECT * FROM environments WHERE env_id = ?1")
            .bind(env_id)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_environment)
            .transpose()
    }

    /// Ownership-scoped lookup; a foreign env is indistinguishable from a
    /// missing one.
    pub async fn get_owned(
        &self,
        user_id: &str,
        env_id: &str,
    ) -> Result<Option<Environment>, sqlx::Error> {
        sqlx::query("SELECT * FROM environments WHERE env_id = ?1 AND user_id = ?2")
            .bind(env_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_environment)
            .transpose()
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Environment>, sqlx::Error> {
        sqlx::query(
            "SELECT * FROM environments WHERE user_id = ?1 AND status != 'DELETED' \
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(row_to_environment)
        .collect()
    }

    /// Per-user name uniqueness, ignoring rows that finished deleting.
    pub async fn name_in_use(&self, user_id: &str, name: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM environments \
             WHERE user_id = ?1 AND name = ?2 AND status != 'DELETED'",
        )
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    /// Domain uniqueness is global across all live environments.
    pub async fn domain_in_use(&self, domain: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM environments \
             WHERE public_domain = ?1 AND status != 'DELETED'",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    pub async fn set_status(
        &self,
        env_id: &str,
        status: EnvironmentStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE environments SET status = ?1 WHERE env_id = ?2")
            .bind(status.to_string())
            .bind(env_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn mark_active(
        &self,
        env_id: &str,
        driver_network_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE environments SET status = 'ACTIVE', driver_network_id = ?1, error_message = NULL \
             WHERE env_id = ?2",
        )
        .bind(driver_network_id)
        .bind(env_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn mark_error(&self, env_id: &str, message: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE environments SET status = 'ERROR', error_message = ?1 WHERE env_id = ?2")
            .bind(message)
            .bind(env_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn make_public(&self, env_id: &str, domain: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE environments SET is_public = 1, public_domain = ?1 WHERE env_id = ?2",
        )
        .bind(domain)
        .bind(env_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub(super) fn row_to_environment(row: sqlx::sqlite::SqliteRow) -> Result<Environment, sqlx::Error> {
    let status: String = row.try_get("status")?;

    Ok(Environment {
        env_id: row.try_get("env_id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        overlay_name: row.try_get("overlay_name")?,
        driver_network_id: row.try_get("driver_network_id")?,
        status: decode_enum("status", status)?,
        is_public: row.try_get("is_public")?,
        public_domain: row.try_get("public_domain")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{new_id, Persistence};

    fn env(user_id: &str, name: &str) -> Environment {
        Environment {
            env_id: new_id(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            overlay_name: format!("overlay_env_{name}_{}", Utc::now().timestamp_millis()),
            driver_network_id: None,
            status: EnvironmentStatus::Creating,
            is_public: false,
            public_domain: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn deleted_rows_free_the_name() {
        let store = Persistence::new_in_memory().await;
        let user = store.users().upsert_by_chat_id(1, None).await.unwrap();
        let repo = store.environments();

        let first = env(&user.user_id, "demo");
        repo.insert(&first).await.unwrap();
        assert!(repo.name_in_use(&user.user_id, "demo").await.unwrap());

        repo.set_status(&first.env_id, EnvironmentStatus::Deleted)
            .await
            .unwrap();
        assert!(!repo.name_in_use(&user.user_id, "demo").await.unwrap());

        // And the deleted row no longer shows up in listings.
        assert!(repo.list_for_user(&user.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ownership_scopes_lookups() {
        let store = Persistence::new_in_memory().await;
        let alice = store.users().upsert_by_chat_id(1, None).await.unwrap();
        let bob = store.users().upsert_by_chat_id(2, None).await.unwrap();
        let repo = store.environments();

        let e = env(&alice.user_id, "demo");
        repo.insert(&e).await.unwrap();

        assert!(repo.get_owned(&alice.user_id, &e.env_id).await.unwrap().is_some());
        assert!(repo.get_owned(&bob.user_id, &e.env_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn domain_uniqueness_is_global() {
        let store = Persistence::new_in_memory().await;
        let alice = store.users().upsert_by_chat_id(1, None).await.unwrap();
        let bob = store.users().upsert_by_chat_id(2, None).await.unwrap();
        let repo = store.environments();

        let a = env(&alice.user_id, "one");
        let b = env(&bob.user_id, "two");
        repo.insert(&a).await.unwrap();
        repo.insert(&b).await.unwrap();

        repo.make_public(&a.env_id, "app.example.com").await.unwrap();
        assert!(repo.domain_in_use("app.example.com").await.unwrap());
        assert!(!repo.domain_in_use("other.example.com").await.unwrap());
    }
}
