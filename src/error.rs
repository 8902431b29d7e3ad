use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum PatrickError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown action `{0}`")]
    UnknownAction(String),

    #[error("Job {jid} is locked by `{owner}` till {till}")]
    Locked {
        jid: String,
        owner: String,
        till: i64,
    },

    #[error("Failed to update job {jid}, `{caller}` is not the owner (held by `{owner}`)")]
    NotOwner {
        jid: String,
        caller: String,
        owner: String,
    },

    #[error("Lease generation {presented} for job {jid} is stale, current is {current}")]
    StaleLease {
        jid: String,
        presented: u64,
        current: u64,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} already finished")]
    AlreadyFinished(String),

    #[error("No lock registered for job {0}")]
    LockNotFound(String),

    #[error("Job {jid} is {status}, it must be locked before `{caller}` can report on it")]
    NotLocked {
        jid: String,
        caller: String,
        status: String,
    },

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Webhook signature rejected: {0}")]
    Signature(String),

    #[error("Only builds branches {allowed:?}, got `{branch}`")]
    BranchNotAllowed { branch: String, allowed: Vec<String> },

    #[error("Project not found for repository {0}")]
    ProjectNotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PatrickError>;

impl From<PatrickError> for tonic::Status {
    fn from(err: PatrickError) -> Self {
        let message = err.to_string();
        match err {
            PatrickError::InvalidArgument(_) | PatrickError::UnknownAction(_) => {
                tonic::Status::invalid_argument(message)
            }
            PatrickError::Locked { owner, till, .. } => {
                let mut status = tonic::Status::failed_precondition(message);
                if let Ok(value) = owner.parse() {
                    status.metadata_mut().insert("locked-by", value);
                }
                if let Ok(value) = till.to_string().parse() {
                    status.metadata_mut().insert("till", value);
                }
                status
            }
            PatrickError::NotOwner { .. } | PatrickError::StaleLease { .. } => {
                tonic::Status::permission_denied(message)
            }
            PatrickError::JobNotFound(_)
            | PatrickError::LockNotFound(_)
            | PatrickError::ContentNotFound(_) => tonic::Status::not_found(message),
            PatrickError::AlreadyFinished(_) | PatrickError::NotLocked { .. } => {
                tonic::Status::failed_precondition(message)
            }
            PatrickError::Signature(_) | PatrickError::Unauthorized(_) => {
                tonic::Status::unauthenticated(message)
            }
            PatrickError::BranchNotAllowed { .. } | PatrickError::ProjectNotFound(_) => {
                tonic::Status::failed_precondition(message)
            }
            PatrickError::Store(_) | PatrickError::Publish(_) | PatrickError::Collaborator(_) => {
                tonic::Status::unavailable(message)
            }
            PatrickError::Decode(_)
            | PatrickError::Transport(_)
            | PatrickError::Io(_)
            | PatrickError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

impl PatrickError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            PatrickError::InvalidArgument(_)
            | PatrickError::UnknownAction(_)
            | PatrickError::BranchNotAllowed { .. } => StatusCode::BAD_REQUEST,
            PatrickError::Signature(_) | PatrickError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PatrickError::NotOwner { .. } | PatrickError::StaleLease { .. } => {
                StatusCode::FORBIDDEN
            }
            PatrickError::JobNotFound(_)
            | PatrickError::LockNotFound(_)
            | PatrickError::ContentNotFound(_)
            | PatrickError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            PatrickError::Locked { .. }
            | PatrickError::AlreadyFinished(_)
            | PatrickError::NotLocked { .. } => StatusCode::CONFLICT,
            PatrickError::Store(_) | PatrickError::Publish(_) | PatrickError::Collaborator(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PatrickError::Decode(_)
            | PatrickError::Transport(_)
            | PatrickError::Io(_)
            | PatrickError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PatrickError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
