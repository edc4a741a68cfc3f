//! Service Module
//!
//! Business logic layer for the store.
//! Services orchestrate repository calls and own the reconciliation rules.

pub mod event;
pub mod request;
pub mod work_item;

// Re-export for convenience
pub use event as event_service;
pub use request as request_service;
pub use work_item as work_item_service;
