//! Event domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Diagnostic record attached to a Work Item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub work_item_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Source of the event, e.g. `dispatch`, `crunch-run`, `stderr`
    pub event_type: String,
    pub text: String,
}
