use chrono::{DateTime, Utc};
use runway_common::Scope;
use sqlx::{Row, SqlitePool};

use super::decode_json;

/// An opaque bearer credential. Revoked and expired rows are never purged;
/// `revoked_at`/`expires_at` gate validity.
#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub user_id: String,
    pub secret_hash: String,
    pub scopes: Vec<Scope>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A one-shot exchange token. Redeemable at most once, within 15 minutes of
/// issuance.
#[derive(Clone, Debug)]
pub struct MagicLink {
    pub token: String,
    pub user_id: String,
    pub scopes: Vec<Scope>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Result of attempting to claim a magic link.
#[derive(Debug)]
pub enum RedeemOutcome {
    Claimed(MagicLink),
    Missing,
    AlreadyUsed,
    Expired,
}

#[derive(Clone)]
pub struct CredentialRepository {
    pool: SqlitePool,
}

impl CredentialRepository {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_magic_link(&self, link: &MagicLink) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO magic_links (token, user_id, scopes, created_at, expires_at, used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        )
        .bind(&link.token)
        .bind(&link.user_id)
        .bind(scopes_json(&link.scopes))
        .bind(link.created_at)
        .bind(link.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically stamp `used_at` iff the link is unused and unexpired. The
    /// conditional update is the compare-and-set: of two racing redemptions
    /// exactly one sees `rows_affected == 1`.
    pub async fn claim_magic_link(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<RedeemOutcome, sqlx::Error> {
        let affected = sqlx::query(
            "UPDATE magic_links SET used_at = ?1 \
             WHERE token = ?2 AND used_at IS NULL AND expires_at > ?1",
        )
        .bind(now)
        .bind(token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let row = sqlx::query("SELECT * FROM magic_links WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(RedeemOutcome::Missing);
        };
        let link = row_to_link(row)?;

        if affected == 1 {
            Ok(RedeemOutcome::Claimed(link))
        } else if link.used_at.is_some() {
            Ok(RedeemOutcome::AlreadyUsed)
        } else {
            Ok(RedeemOutcome::Expired)
        }
    }

    pub async fn insert_key(&self, key: &ApiKeyRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO api_keys (key_id, user_id, secret_hash, scopes, created_at, expires_at, revoked_at, last_used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)",
        )
        .bind(&key.key_id)
        .bind(&key.user_id)
        .bind(&key.secret_hash)
        .bind(scopes_json(&key.scopes))
        .bind(key.created_at)
        .bind(key.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, sqlx::Error> {
        sqlx::query("SELECT * FROM api_keys WHERE key_id = ?1")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_key)
            .transpose()
    }

    pub async fn list_keys_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ApiKeyRecord>, sqlx::Error> {
        sqlx::query("SELECT * FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(row_to_key)
            .collect()
    }

    /// Revoke a key owned by `user_id`. Returns `false` when no such owned
    /// key exists (indistinguishable from non-existence for the caller).
    pub async fn revoke_key(
        &self,
        user_id: &str,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let affected = sqlx::query(
            "UPDATE api_keys SET revoked_at = ?1 \
             WHERE key_id = ?2 AND user_id = ?3 AND revoked_at IS NULL",
        )
        .bind(now)
        .bind(key_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    /// Best-effort bookkeeping; callers log and discard failures.
    pub async fn touch_last_used(
        &self,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE api_keys SET last_used_at = ?1 WHERE key_id = ?2")
            .bind(now)
            .bind(key_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn scopes_json(scopes: &[Scope]) -> String {
    serde_json::to_string(scopes).expect("scopes always serialize")
}

fn row_to_key(row: sqlx::sqlite::SqliteRow) -> Result<ApiKeyRecord, sqlx::Error> {
    let scopes: String = row.try_get("scopes")?;

    Ok(ApiKeyRecord {
        key_id: row.try_get("key_id")?,
        user_id: row.try_get("user_id")?,
        secret_hash: row.try_get("secret_hash")?,
        scopes: decode_json("scopes", &scopes)?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        last_used_at: row.try_get("last_used_at")?,
    })
}

fn row_to_link(row: sqlx::sqlite::SqliteRow) -> Result<MagicLink, sqlx::Error> {
    let scopes: String = row.try_get("scopes")?;

    Ok(MagicLink {
        token: row.try_get("token")?,
        user_id: row.try_get("user_id")?,
        scopes: decode_json("scopes", &scopes)?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        used_at: row.try_get("used_at")?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::persistence::Persistence;

    async fn store_with_user() -> (Persistence, String) {
        let store = Persistence::new_in_memory().await;
        let user = store.users().upsert_by_chat_id(1, None).await.unwrap();
        (store, user.user_id)
    }

    fn link(user_id: &str, token: &str, minutes: i64) -> MagicLink {
        let now = Utc::now();
        MagicLink {
            token: token.to_string(),
            user_id: user_id.to_string(),
            scopes: vec![Scope::EnvRead, Scope::EnvWrite],
            created_at: now,
            expires_at: now + Duration::minutes(minutes),
            used_at: None,
        }
    }

    #[tokio::test]
    async fn claim_happens_exactly_once() {
        let (store, user_id) = store_with_user().await;
        let repo = store.credentials();

        repo.insert_magic_link(&link(&user_id, "token-once", 15))
            .await
            .unwrap();

        let first = repo.claim_magic_link("token-once", Utc::now()).await.unwrap();
        assert!(matches!(first, RedeemOutcome::Claimed(_)));

        let second = repo.claim_magic_link("token-once", Utc::now()).await.unwrap();
        assert!(matches!(second, RedeemOutcome::AlreadyUsed));
    }

    #[tokio::test]
    async fn expired_and_missing_links_are_distinguished() {
        let (store, user_id) = store_with_user().await;
        let repo = store.credentials();

        repo.insert_magic_link(&link(&user_id, "token-old", -1))
            .await
            .unwrap();

        assert!(matches!(
            repo.claim_magic_link("token-old", Utc::now()).await.unwrap(),
            RedeemOutcome::Expired
        ));
        assert!(matches!(
            repo.claim_magic_link("no-such-token", Utc::now()).await.unwrap(),
            RedeemOutcome::Missing
        ));
    }

    #[tokio::test]
    async fn racing_claims_produce_one_winner() {
        let (store, user_id) = store_with_user().await;
        let repo = store.credentials();

        repo.insert_magic_link(&link(&user_id, "token-race", 15))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.claim_magic_link("token-race", Utc::now()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RedeemOutcome::Claimed(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn revoke_respects_ownership() {
        let (store, user_id) = store_with_user().await;
        let other = store.users().upsert_by_chat_id(2, None).await.unwrap();
        let repo = store.credentials();

        let key = ApiKeyRecord {
            key_id: "abcdefghijklmnop".to_string(),
            user_id: user_id.clone(),
            secret_hash: "$2b$12$irrelevant".to_string(),
            scopes: vec![Scope::EnvRead],
            created_at: Utc::now(),
            expires_at: None,
            revoked_at: None,
            last_used_at: None,
        };
        repo.insert_key(&key).await.unwrap();

        assert!(!repo
            .revoke_key(&other.user_id, &key.key_id, Utc::now())
            .await
            .unwrap());
        assert!(repo.revoke_key(&user_id, &key.key_id, Utc::now()).await.unwrap());

        let reloaded = repo.get_key(&key.key_id).await.unwrap().unwrap();
        assert!(reloaded.is_revoked());
        // Revoking twice finds nothing left to revoke.
        assert!(!repo.revoke_key(&user_id, &key.key_id, Utc::now()).await.unwrap());
    }
}
