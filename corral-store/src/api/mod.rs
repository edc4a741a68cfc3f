//! API Module
//!
//! HTTP API layer for the store.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod request;
pub mod work_item;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::store::Store;

/// Create the main API router with all endpoints
pub fn create_router(store: Store) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Request endpoints
        .route("/requests", post(request::create_request))
        .route("/requests/{id}", get(request::get_request))
        .route("/requests/{id}/commit", post(request::commit_request))
        .route("/requests/{id}/priority", post(request::set_priority))
        .route("/requests/{id}/cancel", post(request::cancel_request))
        // Work item endpoints
        .route("/work_items", get(work_item::list_work_items))
        .route("/work_items/{id}", get(work_item::get_work_item))
        .route("/work_items/{id}/lock", post(work_item::lock_work_item))
        .route("/work_items/{id}/unlock", post(work_item::unlock_work_item))
        .route("/work_items/{id}/state", post(work_item::report_state))
        .route(
            "/work_items/{id}/events",
            get(work_item::list_events).post(work_item::record_event),
        )
        .route("/sweep", post(work_item::sweep))
        // Add state and middleware
        .with_state(store)
        .layer(TraceLayer::new_for_http())
}
