use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use super::new_id;

/// A chat-identified principal. Created on first `/start`; never deleted in
/// normal operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub chat_id: i64,
    pub handle: Option<String>,
    pub notify_deployments: bool,
    pub notify_environments: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find-or-create by chat id. An existing row keeps its preferences but
    /// picks up a changed handle.
    pub async fn upsert_by_chat_id(
        &self,
        chat_id: i64,
        handle: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        if let Some(existing) = self.get_by_chat_id(chat_id).await? {
            if handle.is_some() && handle != existing.handle.as_deref() {
                sqlx::query("UPDATE users SET handle = ?1 WHERE user_id = ?2")
                    .bind(handle)
                    .bind(&existing.user_id)
                    .execute(&self.pool)
                    .await?;
            }
            return Ok(User {
                handle: handle.map(str::to_string).or(existing.handle),
                ..existing
            });
        }

        let user = User {
            user_id: new_id(),
            chat_id,
            handle: handle.map(str::to_string),
            notify_deployments: true,
            notify_environments: true,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO users (user_id, chat_id, handle, notify_deployments, notify_environments, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&user.user_id)
        .bind(user.chat_id)
        .bind(&user.handle)
        .bind(user.notify_deployments)
        .bind(user.notify_environments)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query("SELECT * FROM users WHERE user_id = ?1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_user)
            .transpose()
    }

    pub async fn get_by_chat_id(&self, chat_id: i64) -> Result<Option<User>, sqlx::Error> {
        sqlx::query("SELECT * FROM users WHERE chat_id = ?1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_user)
            .transpose()
    }

    pub async fn set_notifications(
        &self,
        user_id: &str,
        deployments: bool,
        environments: bool,
    ) -> Result<bool, sqlx::Error> {
        let affected = sqlx::query(
            "UPDATE users SET notify_deployments = ?1, notify_environments = ?2 WHERE user_id = ?3",
        )
        .bind(deployments)
        .bind(environments)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }
}

fn row_to_user(row: sqlx::sqlite::SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        user_id: row.try_get("user_id")?,
        chat_id: row.try_get("chat_id")?,
        handle: row.try_get("handle")?,
        notify_deployments: row.try_get("notify_deployments")?,
        notify_environments: row.try_get("notify_environments")?,
        created_at: row.try_get("created_at")?,
    })
}
