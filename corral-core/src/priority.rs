//! Priority derivation and scheduler niceness mapping

use crate::domain::request::Request;

/// Priorities above this are treated as this value by the scheduler mapping
pub const MAX_PRIORITY: i64 = 1000;

/// Niceness step per unit of priority
const NICENESS_SCALE: i64 = 1000;

/// Derives a Work Item's priority from the Requests referencing it.
///
/// Returns the max priority over Committed Requests with positive priority,
/// or 0 when there are none.
pub fn derived_priority<'a>(requests: impl IntoIterator<Item = &'a Request>) -> i64 {
    requests
        .into_iter()
        .map(Request::effective_priority)
        .max()
        .unwrap_or(0)
}

/// Maps a Work Item priority onto the batch scheduler's niceness.
///
/// Higher priority gives lower niceness. Priorities outside `0..=1000` are
/// clamped, so priority 0 maps to the largest niceness.
pub fn niceness(priority: i64) -> i64 {
    (MAX_PRIORITY - priority.clamp(0, MAX_PRIORITY)) * NICENESS_SCALE
}
