//! Work Item DTOs

use serde::{Deserialize, Serialize};

use crate::domain::work_item::WorkItemState;

/// Claim or release a Work Item on behalf of an identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub identity: String,
}

/// State report sent by the dispatcher or runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: WorkItemState,
    /// Reporter identity; required for transitions that need the lock
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Output manifest portable data hash
    #[serde(default)]
    pub output: Option<String>,
    /// Log manifest portable data hash
    #[serde(default)]
    pub log: Option<String>,
}

impl StateReport {
    pub fn running(identity: impl Into<String>) -> Self {
        Self {
            state: WorkItemState::Running,
            identity: Some(identity.into()),
            exit_code: None,
            output: None,
            log: None,
        }
    }

    pub fn complete(
        identity: impl Into<String>,
        exit_code: i32,
        output: Option<String>,
        log: Option<String>,
    ) -> Self {
        Self {
            state: WorkItemState::Complete,
            identity: Some(identity.into()),
            exit_code: Some(exit_code),
            output,
            log,
        }
    }

    pub fn cancelled(identity: Option<String>) -> Self {
        Self {
            state: WorkItemState::Cancelled,
            identity,
            exit_code: None,
            output: None,
            log: None,
        }
    }
}

/// Diagnostic event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub event_type: String,
    pub text: String,
}

impl RecordEvent {
    pub fn new(event_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            text: text.into(),
        }
    }
}

/// Query string for listing Work Items, e.g. `?states=Queued,Locked`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListWorkItemsQuery {
    #[serde(default)]
    pub states: Option<String>,
}

impl ListWorkItemsQuery {
    pub fn from_states(states: &[WorkItemState]) -> Self {
        if states.is_empty() {
            return Self::default();
        }
        let joined = states
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            states: Some(joined),
        }
    }

    /// Parses the state filter. An absent or empty filter means all states.
    pub fn parse_states(&self) -> Result<Vec<WorkItemState>, String> {
        match self.states.as_deref() {
            None | Some("") => Ok(Vec::new()),
            Some(list) => list.split(',').map(|s| s.trim().parse()).collect(),
        }
    }
}
