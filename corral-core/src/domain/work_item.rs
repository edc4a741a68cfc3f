//! Work Item domain types
//!
//! The Work Item is the canonical, deduplicated unit of execution. Its
//! priority is derived from the Requests that reference it and its state
//! only moves along the edges allowed by [`WorkItemState::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::request::{ExecutionSpec, ResourceConstraints, SchedulingHints};

/// Canonical unit of scheduled execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub state: WorkItemState,
    /// Derived: max priority over positive Committed Requests, or 0
    pub priority: i64,
    /// Identity holding the lock; set iff state is Locked or Running
    pub locked_by: Option<String>,
    pub runtime_constraints: ResourceConstraints,
    pub scheduling: SchedulingHints,
    pub spec: ExecutionSpec,
    /// Hash of spec + constraints used for reuse matching
    pub fingerprint: String,
    /// Portable data hash of the output manifest (Complete only)
    pub output: Option<String>,
    /// Portable data hash of the log manifest (Complete only)
    pub log: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl WorkItem {
    /// Builds a fresh Queued Work Item from the committing Request's spec
    pub fn new(
        spec: ExecutionSpec,
        runtime_constraints: ResourceConstraints,
        scheduling: SchedulingHints,
    ) -> Self {
        let now = Utc::now();
        let fingerprint = fingerprint(&spec, &runtime_constraints);
        Self {
            id: Uuid::new_v4(),
            state: WorkItemState::Queued,
            priority: 0,
            locked_by: None,
            runtime_constraints,
            scheduling,
            spec,
            fingerprint,
            output: None,
            log: None,
            exit_code: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Whether a Complete item can satisfy a new Request without rerunning
    pub fn is_reusable_result(&self) -> bool {
        self.state == WorkItemState::Complete && self.exit_code == Some(0) && self.output.is_some()
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        self.locked_by.as_deref() == Some(identity)
    }
}

/// Work Item lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkItemState {
    Queued,
    Locked,
    Running,
    Complete,
    Cancelled,
}

impl WorkItemState {
    pub const ALL: [WorkItemState; 5] = [
        WorkItemState::Queued,
        WorkItemState::Locked,
        WorkItemState::Running,
        WorkItemState::Complete,
        WorkItemState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemState::Complete | WorkItemState::Cancelled)
    }

    /// States in which `locked_by` must be set
    pub fn is_locked(&self) -> bool {
        matches!(self, WorkItemState::Locked | WorkItemState::Running)
    }

    /// Allowed edges of the Work Item state machine
    pub fn can_transition_to(&self, next: WorkItemState) -> bool {
        use WorkItemState::*;
        matches!(
            (self, next),
            (Queued, Locked)
                | (Locked, Queued)
                | (Locked, Running)
                | (Running, Complete)
                | (Queued, Cancelled)
                | (Locked, Cancelled)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Queued => "Queued",
            WorkItemState::Locked => "Locked",
            WorkItemState::Running => "Running",
            WorkItemState::Complete => "Complete",
            WorkItemState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkItemState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown work item state: {}", s))
    }
}

/// Computes the reuse fingerprint for an execution spec and its constraints.
///
/// Map-typed fields are ordered, so equal specs serialize to equal bytes.
pub fn fingerprint(spec: &ExecutionSpec, constraints: &ResourceConstraints) -> String {
    let mut hasher = Sha256::new();
    // Serializing these plain data types cannot fail
    if let Ok(bytes) = serde_json::to_vec(&(spec, constraints)) {
        hasher.update(&bytes);
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(command: &str) -> ExecutionSpec {
        ExecutionSpec {
            command: vec![command.to_string()],
            container_image: "fa3c1a9cb6783f85f2ecda037e07b8c3+167".to_string(),
            cwd: "/".to_string(),
            environment: BTreeMap::from([("A".to_string(), "1".to_string())]),
            mounts: BTreeMap::new(),
            output_path: "/out".to_string(),
        }
    }

    fn constraints() -> ResourceConstraints {
        ResourceConstraints {
            vcpus: 2,
            ram_bytes: 30,
            scratch_bytes: 0,
            gpus: None,
        }
    }

    #[test]
    fn test_allowed_transitions() {
        use WorkItemState::*;
        assert!(Queued.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Queued));
        assert!(Locked.can_transition_to(Running));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Complete));
        assert!(!Locked.can_transition_to(Complete));
        assert!(!Running.can_transition_to(Queued));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [WorkItemState::Complete, WorkItemState::Cancelled] {
            assert!(from.is_terminal());
            for to in WorkItemState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_discriminating() {
        let a = fingerprint(&spec("echo"), &constraints());
        let b = fingerprint(&spec("echo"), &constraints());
        let c = fingerprint(&spec("ls"), &constraints());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_new_work_item_is_queued_and_unlocked() {
        let item = WorkItem::new(spec("echo"), constraints(), SchedulingHints::default());
        assert_eq!(item.state, WorkItemState::Queued);
        assert_eq!(item.priority, 0);
        assert!(item.locked_by.is_none());
        assert!(!item.is_reusable_result());
    }
}
