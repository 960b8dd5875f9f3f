//! The explicit request guard chain: authenticate, attach the principal,
//! check the route's static scope set, then dispatch.

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use http::request::Parts;
use runway_common::Scope;

use super::RouterState;
use crate::error::{Error, ErrorKind};
use crate::persistence::{ApiKeyRecord, User};

pub const API_KEY_HEADER: &str = "x-api-key";

/// An authenticated caller: the verified key and its owner. Only proves
/// identity -- scope checks are the wrappers' job.
#[derive(Clone)]
pub struct Principal {
    pub user: User,
    pub key: ApiKeyRecord,
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    RouterState: FromRef<S>,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(API_KEY_HEADER)
            .ok_or_else(|| Error::from_kind(ErrorKind::KeyMissing))?
            .to_str()
            .map_err(|_| Error::from_kind(ErrorKind::Unauthorized))?;

        let state = RouterState::from_ref(state);
        let (user, key) = state.credentials.authenticate(header).await?;

        Ok(Self { user, key })
    }
}

macro_rules! scoped_guard {
    ($(#[$doc:meta])* $name:ident, $required:expr) => {
        $(#[$doc])*
        pub struct $name(pub Principal);

        #[async_trait]
        impl<S> FromRequestParts<S> for $name
        where
            S: Send + Sync,
            RouterState: FromRef<S>,
        {
            type Rejection = Error;

            async fn from_request_parts(
                parts: &mut Parts,
                state: &S,
            ) -> Result<Self, Self::Rejection> {
                let principal = Principal::from_request_parts(parts, state).await?;
                let state = RouterState::from_ref(state);
                state.credentials.check_scopes(&principal.key, &$required)?;
                Ok(Self(principal))
            }
        }
    };
}

scoped_guard!(
    /// Requires `env.read`.
    EnvReader,
    [Scope::EnvRead]
);
scoped_guard!(
    /// Requires `env.write`.
    EnvWriter,
    [Scope::EnvWrite]
);
scoped_guard!(
    /// Requires `deploy.read`.
    DeployReader,
    [Scope::DeployRead]
);
scoped_guard!(
    /// Requires `deploy.write`.
    DeployWriter,
    [Scope::DeployWrite]
);
scoped_guard!(
    /// Requires `logs.read`.
    LogsReader,
    [Scope::LogsRead]
);
