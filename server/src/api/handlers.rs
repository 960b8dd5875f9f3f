//! HTTP handlers. Pure translation: marshal input, call the service, map
//! the result -- no domain logic lives here.

use axum::extract::{Path, Query, State};
use axum::Json;
use http::StatusCode;
use runway_common::models::deployment::{
    CreateDeploymentRequest, CreateGitDeploymentRequest, DeploymentCreatedResponse,
    DeploymentResponse, LogsResponse,
};
use runway_common::models::environment::{
    CreateEnvironmentRequest, EnvironmentResponse, MakePublicRequest,
};
use runway_common::models::user::{KeyResponse, RevokeKeyRequest, VerifiedKeyResponse};
use serde::{Deserialize, Serialize};

use super::extract::{DeployReader, DeployWriter, EnvReader, EnvWriter, LogsReader, Principal};
use super::RouterState;
use crate::error::{Error, ErrorKind};

const DEFAULT_LOG_TAIL: u32 = 100;

#[derive(Deserialize)]
pub(super) struct VerifyParams {
    token: String,
}

#[derive(Serialize)]
pub(super) struct MessageResponse {
    message: String,
}

pub(super) async fn verify_token(
    State(state): State<RouterState>,
    Query(params): Query<VerifyParams>,
) -> Result<Json<VerifiedKeyResponse>, Error> {
    let (api_key, expires_at) = state.credentials.redeem_magic_link(&params.token).await?;

    Ok(Json(VerifiedKeyResponse {
        api_key,
        expires_at,
    }))
}

pub(super) async fn list_keys(
    State(state): State<RouterState>,
    principal: Principal,
) -> Result<Json<Vec<KeyResponse>>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let keys = state
        .store
        .credentials()
        .list_keys_for_user(&principal.user.user_id)
        .await?;

    Ok(Json(
        keys.into_iter()
            .map(|key| KeyResponse {
                key_id: key.key_id,
                scopes: key.scopes,
                expires_at: key.expires_at,
                last_used_at: key.last_used_at,
                created_at: key.created_at,
                revoked: key.revoked_at.is_some(),
            })
            .collect(),
    ))
}

pub(super) async fn revoke_key(
    State(state): State<RouterState>,
    principal: Principal,
    Json(body): Json<RevokeKeyRequest>,
) -> Result<Json<MessageResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let revoked = state
        .store
        .credentials()
        .revoke_key(&principal.user.user_id, &body.key_id, chrono::Utc::now())
        .await?;

    if !revoked {
        return Err(Error::from_kind(ErrorKind::NotFound));
    }

    Ok(Json(MessageResponse {
        message: format!("key {} revoked", body.key_id),
    }))
}

pub(super) async fn create_environment(
    State(state): State<RouterState>,
    EnvWriter(principal): EnvWriter,
    Json(body): Json<CreateEnvironmentRequest>,
) -> Result<(StatusCode, Json<EnvironmentResponse>), Error> {
    state.limits.general(&principal.key.key_id)?;

    let env = state
        .environments
        .create_environment(&principal.user.user_id, &body.name)
        .await?;

    Ok((StatusCode::CREATED, Json(env.into())))
}

pub(super) async fn list_environments(
    State(state): State<RouterState>,
    EnvReader(principal): EnvReader,
) -> Result<Json<Vec<EnvironmentResponse>>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let envs = state
        .environments
        .list_environments(&principal.user.user_id)
        .await?;

    Ok(Json(envs.into_iter().map(Into::into).collect()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct EnvironmentDetailResponse {
    #[serde(flatten)]
    environment: EnvironmentResponse,
    deployments: Vec<DeploymentResponse>,
}

pub(super) async fn get_environment(
    State(state): State<RouterState>,
    EnvReader(principal): EnvReader,
    Path(env_id): Path<String>,
) -> Result<Json<EnvironmentDetailResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let env = state
        .environments
        .get_environment(&principal.user.user_id, &env_id)
        .await?;
    let deployments = state
        .engine
        .list_by_environment(&principal.user.user_id, &env_id)
        .await?;

    Ok(Json(EnvironmentDetailResponse {
        environment: env.into(),
        deployments,
    }))
}

pub(super) async fn delete_environment(
    State(state): State<RouterState>,
    EnvWriter(principal): EnvWriter,
    Path(env_id): Path<String>,
) -> Result<Json<MessageResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    state
        .environments
        .delete_environment(&principal.user.user_id, &env_id)
        .await?;

    Ok(Json(MessageResponse {
        message: "environment deleted".to_string(),
    }))
}

pub(super) async fn make_public(
    State(state): State<RouterState>,
    EnvWriter(principal): EnvWriter,
    Path(env_id): Path<String>,
    Json(body): Json<MakePublicRequest>,
) -> Result<Json<EnvironmentResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let env = state
        .environments
        .make_public(&principal.user.user_id, &env_id, &body.domain)
        .await?;

    Ok(Json(env.into()))
}

pub(super) async fn create_deployment(
    State(state): State<RouterState>,
    DeployWriter(principal): DeployWriter,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentCreatedResponse>), Error> {
    state.limits.registry_deploy(&principal.key.key_id)?;

    let created = state
        .engine
        .create_from_registry(&principal.user.user_id, body)
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub(super) async fn create_git_deployment(
    State(state): State<RouterState>,
    DeployWriter(principal): DeployWriter,
    Json(body): Json<CreateGitDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentCreatedResponse>), Error> {
    state.limits.git_deploy(&principal.key.key_id)?;

    let created = state
        .engine
        .create_from_git(&principal.user.user_id, body)
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub(super) async fn get_job(
    State(state): State<RouterState>,
    DeployReader(principal): DeployReader,
    Path(job_id): Path<String>,
) -> Result<Json<DeploymentResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let response = state
        .engine
        .get_status(&principal.user.user_id, &job_id)
        .await?;

    Ok(Json(response))
}

pub(super) async fn list_for_environment(
    State(state): State<RouterState>,
    DeployReader(principal): DeployReader,
    Path(env_id): Path<String>,
) -> Result<Json<Vec<DeploymentResponse>>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let responses = state
        .engine
        .list_by_environment(&principal.user.user_id, &env_id)
        .await?;

    Ok(Json(responses))
}

#[derive(Deserialize)]
pub(super) struct LogsParams {
    tail: Option<u32>,
}

pub(super) async fn get_logs(
    State(state): State<RouterState>,
    LogsReader(principal): LogsReader,
    Path(deployment_id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<LogsResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    let logs = state
        .engine
        .get_logs(
            &principal.user.user_id,
            &deployment_id,
            params.tail.unwrap_or(DEFAULT_LOG_TAIL),
        )
        .await?;

    Ok(Json(LogsResponse { logs }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct DeleteParams {
    preserve_volumes: Option<bool>,
}

pub(super) async fn delete_deployment(
    State(state): State<RouterState>,
    DeployWriter(principal): DeployWriter,
    Path(deployment_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<MessageResponse>, Error> {
    state.limits.general(&principal.key.key_id)?;

    state
        .engine
        .delete(
            &principal.user.user_id,
            &deployment_id,
            params.preserve_volumes.unwrap_or(false),
        )
        .await?;

    Ok(Json(MessageResponse {
        message: "deployment deleted".to_string(),
    }))
}
