//! The HTTP surface. Routes are declared here; everything they need rides
//! in [`RouterState`].

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub mod extract;
mod handlers;
mod health;
pub mod rate_limit;

pub use rate_limit::RateLimits;

use crate::chat;
use crate::credentials::CredentialService;
use crate::deployments::DeploymentEngine;
use crate::environments::EnvironmentService;
use crate::notifier::ChatSink;
use crate::persistence::Persistence;

#[derive(Clone)]
pub struct RouterState {
    pub store: Persistence,
    pub credentials: CredentialService,
    pub environments: EnvironmentService,
    pub engine: DeploymentEngine,
    pub limits: Arc<RateLimits>,
    pub chat_sink: Arc<dyn ChatSink>,
    /// Base url magic links are rendered against.
    pub base_url: String,
}

pub fn make_router(state: RouterState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/auth/verify", get(handlers::verify_token))
        .route("/auth/keys", get(handlers::list_keys))
        .route("/auth/revoke", post(handlers::revoke_key))
        .route(
            "/environments",
            post(handlers::create_environment).get(handlers::list_environments),
        )
        .route(
            "/environments/:env_id",
            get(handlers::get_environment).delete(handlers::delete_environment),
        )
        .route("/environments/:env_id/public", post(handlers::make_public))
        .route("/deployments", post(handlers::create_deployment))
        .route("/deployments/from-git", post(handlers::create_git_deployment))
        .route("/deployments/job/:job_id", get(handlers::get_job))
        .route(
            "/deployments/environment/:env_id",
            get(handlers::list_for_environment),
        )
        .route("/deployments/:deployment_id/logs", get(handlers::get_logs))
        .route(
            "/deployments/:deployment_id",
            delete(handlers::delete_deployment),
        )
        .route("/chat/update", post(chat::webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
