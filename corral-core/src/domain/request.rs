//! Request domain types
//!
//! A Request is a caller's ask for work. Committed Requests resolve to a
//! canonical Work Item which carries the derived priority and state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::mount::Mount;

/// A caller's ask for work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub name: Option<String>,
    pub state: RequestState,
    /// Caller-assigned priority. May be nil while Uncommitted.
    pub priority: Option<i64>,
    /// Owning Work Item, set on commit
    pub work_item_id: Option<Uuid>,
    /// Work Item that issued this Request (nested jobs)
    pub requesting_work_item_id: Option<Uuid>,
    pub runtime_constraints: ResourceConstraints,
    pub scheduling: SchedulingHints,
    pub spec: ExecutionSpec,
    /// Attempt to attach to a matching existing Work Item on commit
    pub use_existing: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Request {
    /// Priority this Request contributes to its Work Item.
    ///
    /// Only Committed Requests with a positive priority count; everything
    /// else contributes 0.
    pub fn effective_priority(&self) -> i64 {
        match (self.state, self.priority) {
            (RequestState::Committed, Some(p)) if p > 0 => p,
            _ => 0,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.state == RequestState::Committed
    }
}

/// Request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Uncommitted,
    Committed,
    Final,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Uncommitted => "Uncommitted",
            RequestState::Committed => "Committed",
            RequestState::Final => "Final",
        }
    }
}

impl std::str::FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Uncommitted" => Ok(RequestState::Uncommitted),
            "Committed" => Ok(RequestState::Committed),
            "Final" => Ok(RequestState::Final),
            other => Err(format!("unknown request state: {}", other)),
        }
    }
}

/// Resources a job needs from the node it runs on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraints {
    pub vcpus: u32,
    pub ram_bytes: u64,
    #[serde(default)]
    pub scratch_bytes: u64,
    #[serde(default)]
    pub gpus: Option<u32>,
}

impl ResourceConstraints {
    /// Checks that the constraints describe a schedulable job
    pub fn validate(&self) -> Result<(), String> {
        if self.vcpus == 0 {
            return Err("runtime_constraints.vcpus must be at least 1".to_string());
        }
        if self.ram_bytes == 0 {
            return Err("runtime_constraints.ram_bytes must be at least 1".to_string());
        }
        if self.gpus == Some(0) {
            return Err("runtime_constraints.gpus must be omitted or at least 1".to_string());
        }
        Ok(())
    }
}

/// Hints passed through to the batch scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingHints {
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub preemptible: bool,
    /// Upper bound on wall-clock runtime, enforced by the batch scheduler
    #[serde(default)]
    pub max_run_time_secs: Option<u64>,
}

/// What to run and where its output goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub command: Vec<String>,
    /// Portable data hash of the image collection
    pub container_image: String,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Mount points keyed by container path
    #[serde(default)]
    pub mounts: BTreeMap<String, Mount>,
    pub output_path: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

impl ExecutionSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.command.is_empty() {
            return Err("command cannot be empty".to_string());
        }
        if self.container_image.is_empty() {
            return Err("container_image cannot be empty".to_string());
        }
        if !self.output_path.starts_with('/') {
            return Err(format!(
                "output_path must be an absolute path, got {:?}",
                self.output_path
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(state: RequestState, priority: Option<i64>) -> Request {
        Request {
            id: Uuid::new_v4(),
            name: None,
            state,
            priority,
            work_item_id: None,
            requesting_work_item_id: None,
            runtime_constraints: ResourceConstraints {
                vcpus: 1,
                ram_bytes: 1 << 20,
                scratch_bytes: 0,
                gpus: None,
            },
            scheduling: SchedulingHints::default(),
            spec: ExecutionSpec {
                command: vec!["true".to_string()],
                container_image: "img".to_string(),
                cwd: "/".to_string(),
                environment: BTreeMap::new(),
                mounts: BTreeMap::new(),
                output_path: "/out".to_string(),
            },
            use_existing: true,
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_effective_priority_only_counts_committed_positive() {
        assert_eq!(request(RequestState::Committed, Some(7)).effective_priority(), 7);
        assert_eq!(request(RequestState::Committed, Some(0)).effective_priority(), 0);
        assert_eq!(request(RequestState::Committed, Some(-3)).effective_priority(), 0);
        assert_eq!(request(RequestState::Uncommitted, Some(7)).effective_priority(), 0);
        assert_eq!(request(RequestState::Final, Some(7)).effective_priority(), 0);
        assert_eq!(request(RequestState::Committed, None).effective_priority(), 0);
    }

    #[test]
    fn test_constraints_validation() {
        let mut c = ResourceConstraints {
            vcpus: 2,
            ram_bytes: 30,
            scratch_bytes: 0,
            gpus: None,
        };
        assert!(c.validate().is_ok());

        c.vcpus = 0;
        assert!(c.validate().is_err());

        c.vcpus = 1;
        c.ram_bytes = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_state_roundtrip_str() {
        for state in [
            RequestState::Uncommitted,
            RequestState::Committed,
            RequestState::Final,
        ] {
            assert_eq!(state.as_str().parse::<RequestState>().unwrap(), state);
        }
        assert!("Bogus".parse::<RequestState>().is_err());
    }
}
