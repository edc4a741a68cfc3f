//! Request API Handlers
//!
//! HTTP endpoints for the Request lifecycle.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use corral_core::domain::Request;
use corral_core::dto::request::{CreateRequest, SetPriority};
use uuid::Uuid;

use crate::api::error::ApiResult;
use crate::store::Store;

/// POST /requests
/// Create a Request, optionally committing it in the same call
pub async fn create_request(
    State(store): State<Store>,
    Json(req): Json<CreateRequest>,
) -> ApiResult<(StatusCode, Json<Request>)> {
    tracing::debug!("Creating request (commit: {})", req.commit);

    let request = store.create_request(req).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// GET /requests/{id}
pub async fn get_request(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Request>> {
    tracing::debug!("Getting request: {}", id);

    Ok(Json(store.get_request(id).await?))
}

/// POST /requests/{id}/commit
pub async fn commit_request(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Request>> {
    tracing::info!("Committing request: {}", id);

    Ok(Json(store.commit(id).await?))
}

/// POST /requests/{id}/priority
pub async fn set_priority(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetPriority>,
) -> ApiResult<Json<Request>> {
    tracing::info!("Setting priority of request {} to {}", id, req.priority);

    Ok(Json(store.set_priority(id, req.priority).await?))
}

/// POST /requests/{id}/cancel
pub async fn cancel_request(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Request>> {
    tracing::info!("Cancelling request: {}", id);

    Ok(Json(store.cancel_request(id).await?))
}
