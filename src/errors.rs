use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

use crate::services::{
    bundle_repo::RepoError, bundle_service::ServiceError, bundler_accounts::AccountError,
    chain::ChainError, rule_store::RuleError, staging::StagingError,
};

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("request failed: {}", self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

fn repo_status(err: &RepoError) -> StatusCode {
    match err {
        RepoError::BundleNotFound { .. } | RepoError::NoBundlingBundle(_) => StatusCode::NOT_FOUND,
        RepoError::BundlingBundleExists(_)
        | RepoError::BundleAlreadyExists { .. }
        | RepoError::ObjectAlreadyExists { .. }
        | RepoError::BundleFull { .. }
        | RepoError::InvalidStatus { .. }
        | RepoError::TransitionConflict { .. } => StatusCode::CONFLICT,
        RepoError::BundleNameMismatch { .. } => StatusCode::BAD_REQUEST,
        RepoError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::InvalidArgument { .. } | ServiceError::ChecksumMismatch => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::ObjectTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            ServiceError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::ObjectUnavailable { .. } => StatusCode::CONFLICT,
            ServiceError::Repo(repo) => repo_status(repo),
            ServiceError::Rule(RuleError::Sqlx(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Rule(_) => StatusCode::BAD_REQUEST,
            ServiceError::Account(AccountError::EmptyPool) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Staging(StagingError::NotFound(_)) => StatusCode::NOT_FOUND,
            ServiceError::Staging(StagingError::InvalidKey { .. }) => StatusCode::BAD_REQUEST,
            ServiceError::Chain(ChainError::ObjectNotFound { .. })
            | ServiceError::Chain(ChainError::ObjectIdNotFound(_)) => StatusCode::NOT_FOUND,
            ServiceError::Chain(_) => StatusCode::BAD_GATEWAY,
            ServiceError::NoChainClient(_)
            | ServiceError::Account(_)
            | ServiceError::Staging(_)
            | ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}
