// Handle database interactions. One repository per aggregate; cross-aggregate
// cascades are driven explicitly by the environment and deployment services.

use std::str::FromStr;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::crypto::Encryptor;

pub mod credentials;
pub mod deployments;
pub mod environments;
pub mod users;

pub use credentials::{ApiKeyRecord, CredentialRepository, MagicLink, RedeemOutcome};
pub use deployments::{Deployment, DeploymentRepository, ServiceRecord};
pub use environments::{Environment, EnvironmentRepository};
pub use users::{User, UserRepository};

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct Persistence {
    pool: SqlitePool,
    encryptor: Encryptor,
}

impl Persistence {
    pub async fn from_url(url: &str, encryptor: Encryptor) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            // Cascading deletes depend on this; sqlite defaults it off.
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        info!(%url, "connected to state database");

        Self::from_pool(pool, encryptor).await
    }

    /// An in-memory database for tests. Every pooled connection gets its
    /// own `:memory:` database, so the pool is pinned to a single
    /// connection that never retires.
    pub async fn new_in_memory() -> Self {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .unwrap();

        Self::from_pool(pool, Encryptor::disabled()).await.unwrap()
    }

    async fn from_pool(pool: SqlitePool, encryptor: Encryptor) -> Result<Self, sqlx::Error> {
        MIGRATIONS.run(&pool).await?;

        Ok(Self { pool, encryptor })
    }

    /// Cheap liveness probe, used by the health endpoint and the recovery
    /// supervisor's startup wait.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    pub fn credentials(&self) -> CredentialRepository {
        CredentialRepository::new(self.pool.clone())
    }

    pub fn environments(&self) -> EnvironmentRepository {
        EnvironmentRepository::new(self.pool.clone())
    }

    pub fn deployments(&self) -> DeploymentRepository {
        DeploymentRepository::new(self.pool.clone(), self.encryptor.clone())
    }
}

/// Fresh ulid for a database row id.
pub(crate) fn new_id() -> String {
    ulid::Ulid::new().to_string()
}

pub(crate) fn decode_enum<T>(column: &'static str, value: String) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.parse().map_err(|err: T::Err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

pub(crate) fn decode_json<T>(column: &'static str, value: &str) -> Result<T, sqlx::Error>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_str(value).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}
