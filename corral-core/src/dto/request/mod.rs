//! Request DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::request::{ExecutionSpec, ResourceConstraints, SchedulingHints};

/// Payload to create a new Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    pub runtime_constraints: ResourceConstraints,
    #[serde(default)]
    pub scheduling: SchedulingHints,
    pub spec: ExecutionSpec,
    #[serde(default)]
    pub requesting_work_item_id: Option<Uuid>,
    #[serde(default = "default_use_existing")]
    pub use_existing: bool,
    /// Commit immediately after creation
    #[serde(default)]
    pub commit: bool,
}

fn default_use_existing() -> bool {
    true
}

/// Payload to change a Request's priority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPriority {
    pub priority: i64,
}
