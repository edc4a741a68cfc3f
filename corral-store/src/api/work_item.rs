//! Work Item API Handlers
//!
//! HTTP endpoints used by the dispatcher and runners: listing, locking,
//! state reports and diagnostic events.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use corral_core::domain::{Event, WorkItem};
use corral_core::dto::work_item::{ListWorkItemsQuery, LockRequest, RecordEvent, StateReport};
use serde::Serialize;
use uuid::Uuid;

use crate::api::error::{ApiError, ApiResult};
use crate::store::Store;

// =============================================================================
// Queries
// =============================================================================

/// GET /work_items?states=Queued,Locked
pub async fn list_work_items(
    State(store): State<Store>,
    Query(query): Query<ListWorkItemsQuery>,
) -> ApiResult<Json<Vec<WorkItem>>> {
    let states = query.parse_states().map_err(ApiError::BadRequest)?;
    tracing::debug!("Listing work items in states {:?}", states);

    Ok(Json(store.work_items(&states).await?))
}

/// GET /work_items/{id}
pub async fn get_work_item(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkItem>> {
    tracing::debug!("Getting work item: {}", id);

    Ok(Json(store.find_work_item(id).await?))
}

// =============================================================================
// Lifecycle
// =============================================================================

/// POST /work_items/{id}/lock
pub async fn lock_work_item(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
    Json(req): Json<LockRequest>,
) -> ApiResult<Json<WorkItem>> {
    tracing::debug!("Lock of work item {} requested by {}", id, req.identity);

    Ok(Json(store.lock_item(id, &req.identity).await?))
}

/// POST /work_items/{id}/unlock
pub async fn unlock_work_item(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
    Json(req): Json<LockRequest>,
) -> ApiResult<Json<WorkItem>> {
    tracing::debug!("Unlock of work item {} requested by {}", id, req.identity);

    Ok(Json(store.unlock_item(id, &req.identity).await?))
}

/// POST /work_items/{id}/state
pub async fn report_state(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
    Json(report): Json<StateReport>,
) -> ApiResult<Json<WorkItem>> {
    tracing::info!("State report for work item {}: {}", id, report.state);

    Ok(Json(store.apply_report(id, report).await?))
}

// =============================================================================
// Events
// =============================================================================

/// POST /work_items/{id}/events
pub async fn record_event(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
    Json(event): Json<RecordEvent>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let event = store.add_event(id, event).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// GET /work_items/{id}/events
pub async fn list_events(
    State(store): State<Store>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Event>>> {
    tracing::debug!("Getting events for work item: {}", id);

    Ok(Json(store.events(id).await?))
}

// =============================================================================
// Maintenance
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SweepSummary {
    pub examined: usize,
}

/// POST /sweep
/// Force a priority repair pass, bypassing the sweep lock
pub async fn sweep(State(store): State<Store>) -> ApiResult<Json<SweepSummary>> {
    tracing::info!("Forced priority sweep");

    let examined = store.sweep_unlocked().await?;
    Ok(Json(SweepSummary { examined }))
}
