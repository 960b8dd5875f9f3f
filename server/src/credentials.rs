//! Issuance, verification, and scope enforcement of opaque API keys via the
//! one-time magic-link exchange.

use chrono::{DateTime, Duration, Utc};
use runway_common::key::{random_token, PresentedKey};
use runway_common::{Scope, KEY_ID_LENGTH, KEY_SECRET_LENGTH, MAGIC_LINK_TTL_MINUTES, MAGIC_TOKEN_LENGTH};
use tracing::{debug, instrument, warn};

use crate::error::{Error, ErrorKind};
use crate::persistence::{ApiKeyRecord, MagicLink, Persistence, RedeemOutcome, User};

/// bcrypt work factor for key secrets. Must stay >= 10.
const KDF_COST: u32 = 12;

#[derive(Clone)]
pub struct CredentialService {
    store: Persistence,
}

impl CredentialService {
    pub fn new(store: Persistence) -> Self {
        Self { store }
    }

    /// Mint a one-shot link carrying the scopes of the key it will become.
    #[instrument(skip(self))]
    pub async fn issue_magic_link(
        &self,
        user_id: &str,
        scopes: Vec<Scope>,
    ) -> Result<MagicLink, Error> {
        if scopes.is_empty() {
            return Err(Error::bad_request("at least one scope is required"));
        }

        let now = Utc::now();
        let link = MagicLink {
            token: random_token(MAGIC_TOKEN_LENGTH),
            user_id: user_id.to_string(),
            scopes,
            created_at: now,
            expires_at: now + Duration::minutes(MAGIC_LINK_TTL_MINUTES),
            used_at: None,
        };

        self.store.credentials().insert_magic_link(&link).await?;

        Ok(link)
    }

    /// Exchange a link for a fresh key. Transactional: of racing
    /// redemptions exactly one wins, and the raw secret is returned exactly
    /// once -- it is never persisted and can never be re-derived.
    #[instrument(skip_all)]
    pub async fn redeem_magic_link(
        &self,
        token: &str,
    ) -> Result<(String, Option<DateTime<Utc>>), Error> {
        let now = Utc::now();

        let link = match self.store.credentials().claim_magic_link(token, now).await? {
            RedeemOutcome::Claimed(link) => link,
            RedeemOutcome::Missing | RedeemOutcome::AlreadyUsed | RedeemOutcome::Expired => {
                debug!("magic link rejected");
                return Err(Error::from_kind(ErrorKind::Unauthorized));
            }
        };

        let secret = random_token(KEY_SECRET_LENGTH);
        let secret_hash = bcrypt::hash(&secret, KDF_COST)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;

        let key = ApiKeyRecord {
            key_id: random_token(KEY_ID_LENGTH),
            user_id: link.user_id,
            secret_hash,
            scopes: link.scopes,
            created_at: now,
            expires_at: None,
            revoked_at: None,
            last_used_at: None,
        };
        self.store.credentials().insert_key(&key).await?;

        let presented = PresentedKey::new(key.key_id, secret);
        Ok((presented.to_string(), key.expires_at))
    }

    /// Verify an `X-API-Key` header value. Every failure mode -- bad
    /// format, unknown id, revoked, expired, secret mismatch -- surfaces
    /// identically as unauthenticated.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, header: &str) -> Result<(User, ApiKeyRecord), Error> {
        let presented: PresentedKey = header
            .trim()
            .parse()
            .map_err(|_| Error::from_kind(ErrorKind::Unauthorized))?;

        let key = self
            .store
            .credentials()
            .get_key(presented.key_id())
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::Unauthorized))?;

        let now = Utc::now();
        if key.is_revoked() || key.is_expired(now) {
            return Err(Error::from_kind(ErrorKind::Unauthorized));
        }

        // bcrypt's verify is the constant-time comparator here.
        let matches = bcrypt::verify(presented.secret(), &key.secret_hash)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;
        if !matches {
            return Err(Error::from_kind(ErrorKind::Unauthorized));
        }

        let user = self
            .store
            .users()
            .get(&key.user_id)
            .await?
            .ok_or_else(|| Error::from_kind(ErrorKind::Unauthorized))?;

        // Best-effort bookkeeping; a failure here must not fail the request.
        let repo = self.store.credentials();
        let key_id = key.key_id.clone();
        tokio::spawn(async move {
            if let Err(err) = repo.touch_last_used(&key_id, now).await {
                warn!(error = %err, "failed to update last_used_at");
            }
        });

        Ok((user, key))
    }

    /// Scope gate: `admin` passes unconditionally, otherwise every required
    /// scope must be held.
    pub fn check_scopes(&self, key: &ApiKeyRecord, required: &[Scope]) -> Result<(), Error> {
        if runway_common::scope::satisfies(&key.scopes, required) {
            Ok(())
        } else {
            Err(Error::from_kind(ErrorKind::Forbidden))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service_with_user() -> (CredentialService, String) {
        let store = Persistence::new_in_memory().await;
        let user = store.users().upsert_by_chat_id(1, None).await.unwrap();
        (CredentialService::new(store), user.user_id)
    }

    #[tokio::test]
    async fn magic_link_round_trip() {
        let (service, user_id) = service_with_user().await;

        let link = service
            .issue_magic_link(&user_id, vec![Scope::EnvRead, Scope::EnvWrite])
            .await
            .unwrap();
        assert_eq!(link.token.len(), MAGIC_TOKEN_LENGTH);
        assert!(link.expires_at > Utc::now() + Duration::minutes(14));

        let (formatted, _expires) = service.redeem_magic_link(&link.token).await.unwrap();
        assert!(formatted.starts_with("rw_prod_"));

        // The produced key authenticates and carries the link's scopes.
        let (user, key) = service.authenticate(&formatted).await.unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(key.scopes, vec![Scope::EnvRead, Scope::EnvWrite]);

        // Second redemption fails closed.
        assert_eq!(
            service.redeem_magic_link(&link.token).await.unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[tokio::test]
    async fn authentication_rejects_mutations() {
        let (service, user_id) = service_with_user().await;
        let link = service
            .issue_magic_link(&user_id, vec![Scope::DeployRead])
            .await
            .unwrap();
        let (formatted, _) = service.redeem_magic_link(&link.token).await.unwrap();

        // Flip the final secret character to a different alphabet member.
        let mut mutated = formatted.clone();
        let last = mutated.pop().unwrap();
        mutated.push(if last == 'A' { 'B' } else { 'A' });

        assert!(service.authenticate(&formatted).await.is_ok());
        assert_eq!(
            service.authenticate(&mutated).await.unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            service.authenticate("rw_prod_garbage").await.unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[tokio::test]
    async fn revoked_keys_stop_authenticating() {
        let (service, user_id) = service_with_user().await;
        let link = service
            .issue_magic_link(&user_id, vec![Scope::EnvRead])
            .await
            .unwrap();
        let (formatted, _) = service.redeem_magic_link(&link.token).await.unwrap();

        let presented: PresentedKey = formatted.parse().unwrap();
        service
            .store
            .credentials()
            .revoke_key(&user_id, presented.key_id(), Utc::now())
            .await
            .unwrap();

        assert_eq!(
            service.authenticate(&formatted).await.unwrap_err().kind(),
            ErrorKind::Unauthorized
        );
    }

    #[tokio::test]
    async fn scope_gate_honours_admin() {
        let (service, user_id) = service_with_user().await;
        let link = service
            .issue_magic_link(&user_id, vec![Scope::Admin])
            .await
            .unwrap();
        let (formatted, _) = service.redeem_magic_link(&link.token).await.unwrap();
        let (_, key) = service.authenticate(&formatted).await.unwrap();

        assert!(service
            .check_scopes(&key, &[Scope::DeployWrite, Scope::LogsRead])
            .is_ok());

        let limited = ApiKeyRecord {
            scopes: vec![Scope::EnvRead],
            ..key
        };
        assert_eq!(
            service
                .check_scopes(&limited, &[Scope::EnvWrite])
                .unwrap_err()
                .kind(),
            ErrorKind::Forbidden
        );
    }
}
