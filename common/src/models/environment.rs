use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Longest environment name we accept. Keeps every derived resource name
/// (`job_{env}_{job_id}` in particular) at or under Docker's 63-byte limit.
pub const MAX_ENV_NAME_LENGTH: usize = 32;

/// Lifecycle of a tenant environment. String forms are the values stored in
/// the `environments.status` column.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentStatus {
    Creating,
    Active,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnvironmentRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MakePublicRequest {
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentResponse {
    pub id: String,
    pub name: String,
    pub overlay_name: String,
    pub status: EnvironmentStatus,
    pub is_public: bool,
    pub public_domain: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Environment names become parts of Docker resource names, so the charset
/// is locked down hard: `^[A-Za-z0-9_-]+$`, at most [`MAX_ENV_NAME_LENGTH`].
pub fn valid_environment_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_ENV_NAME_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Public domains must match `^[A-Za-z0-9.-]+\.[A-Za-z]{2,}$`.
pub fn valid_public_domain(domain: &str) -> bool {
    let Some((head, tld)) = domain.rsplit_once('.') else {
        return false;
    };

    !head.is_empty()
        && head
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
        && tld.len() >= 2
        && tld.bytes().all(|b| b.is_ascii_alphabetic())
}
