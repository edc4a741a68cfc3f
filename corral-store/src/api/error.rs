//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::repository::RepoError;
use crate::service::event::EventError;
use crate::service::request::RequestError;
use crate::service::work_item::WorkItemError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// Lost race or lock held by someone else
    Conflict(String),
    /// Record not in a state that permits the operation
    InvalidState(String),
    DatabaseError(RepoError),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InvalidState(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        ApiError::DatabaseError(err)
    }
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::NotFound(id) => ApiError::NotFound(format!("Request {} not found", id)),
            RequestError::WorkItemNotFound(id) => {
                ApiError::BadRequest(format!("Work item {} not found", id))
            }
            RequestError::InvalidState(msg) => ApiError::InvalidState(msg),
            RequestError::ValidationError(msg) => ApiError::BadRequest(msg),
            RequestError::Conflict(msg) => ApiError::Conflict(msg),
            RequestError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<WorkItemError> for ApiError {
    fn from(err: WorkItemError) -> Self {
        match err {
            WorkItemError::NotFound(id) => {
                ApiError::NotFound(format!("Work item {} not found", id))
            }
            WorkItemError::InvalidState(msg) => ApiError::InvalidState(msg),
            WorkItemError::Conflict(msg) => ApiError::Conflict(msg),
            WorkItemError::ValidationError(msg) => ApiError::BadRequest(msg),
            WorkItemError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

impl From<EventError> for ApiError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::WorkItemNotFound(id) => {
                ApiError::NotFound(format!("Work item {} not found", id))
            }
            EventError::ValidationError(msg) => ApiError::BadRequest(msg),
            EventError::DatabaseError(err) => ApiError::DatabaseError(err),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
