use std::error::Error as StdError;
use std::fmt::Formatter;

use axum::response::{IntoResponse, Response};
use http::StatusCode;
use runway_common::models::error::ApiError;
use tokio::sync::mpsc::error::SendError;
use tracing::error;

use crate::docker::DockerError;

/// Category of a domain error. Determines the HTTP status and the (terse)
/// response body; anything richer stays in logs and row `error_message`
/// columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest(String),
    KeyMissing,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict(String),
    RateLimited,
    ServiceUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            ErrorKind::KeyMissing | ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict(_) => StatusCode::CONFLICT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ErrorKind::BadRequest(msg) => msg.clone(),
            ErrorKind::KeyMissing => "missing api key".to_string(),
            ErrorKind::Unauthorized => "unauthorized".to_string(),
            ErrorKind::Forbidden => "forbidden".to_string(),
            ErrorKind::NotFound => "not found".to_string(),
            ErrorKind::Conflict(msg) => msg.clone(),
            ErrorKind::RateLimited => "rate limit exceeded".to_string(),
            ErrorKind::ServiceUnavailable => "service unavailable".to_string(),
            ErrorKind::Internal => "internal server error".to_string(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

/// Server-side error. Safe to return from axum handlers: the
/// [`IntoResponse`] implementation only ever surfaces the category, never
/// the source chain.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            source: Some(Box::new(err)),
        }
    }

    pub fn from_kind(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::from_kind(ErrorKind::BadRequest(message.into()))
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::from_kind(ErrorKind::Conflict(message.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::from_kind(ErrorKind::NotFound),
            err => Self::source(ErrorKind::Internal, err),
        }
    }
}

impl From<DockerError> for Error {
    fn from(err: DockerError) -> Self {
        Self::source(ErrorKind::Internal, err)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::from_kind(ErrorKind::ServiceUnavailable)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.kind.status().is_server_error() {
            error!(error = %self, "request had an error");
        }

        ApiError::new(self.kind.status(), self.kind.message()).into_response()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, ": ")?;
            source.fmt(f)?;
        }
        Ok(())
    }
}

impl StdError for Error {}
