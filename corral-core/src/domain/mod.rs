//! Core domain types
//!
//! These types represent the entities shared between the store (which
//! persists them), the dispatcher and the runner (which act on them).

pub mod event;
pub mod mount;
pub mod request;
pub mod work_item;

pub use event::Event;
pub use mount::Mount;
pub use request::{
    ExecutionSpec, Request, RequestState, ResourceConstraints, SchedulingHints,
};
pub use work_item::{WorkItem, WorkItemState};
