//! Event Service
//!
//! Diagnostic events attached to Work Items.

use corral_core::domain::Event;
use corral_core::dto::work_item::RecordEvent;
use uuid::Uuid;

use crate::repository::{RepoError, Repository};

/// Service error type
#[derive(Debug)]
pub enum EventError {
    WorkItemNotFound(Uuid),
    ValidationError(String),
    DatabaseError(RepoError),
}

impl From<RepoError> for EventError {
    fn from(err: RepoError) -> Self {
        EventError::DatabaseError(err)
    }
}

pub type Result<T> = std::result::Result<T, EventError>;

/// Record an event on a Work Item
pub async fn record_event(
    repo: &dyn Repository,
    work_item_id: Uuid,
    event: RecordEvent,
) -> Result<Event> {
    validate_event(&event)?;

    repo.find_work_item(work_item_id)
        .await?
        .ok_or(EventError::WorkItemNotFound(work_item_id))?;

    let event = Event {
        work_item_id,
        timestamp: chrono::Utc::now(),
        event_type: event.event_type,
        text: event.text,
    };
    repo.insert_event(&event).await?;

    tracing::debug!(
        "Recorded {} event for work item {}",
        event.event_type,
        work_item_id
    );
    Ok(event)
}

/// Get all events for a Work Item, oldest first
pub async fn list_events(repo: &dyn Repository, work_item_id: Uuid) -> Result<Vec<Event>> {
    Ok(repo.find_events(work_item_id).await?)
}

// =============================================================================
// Validation
// =============================================================================

fn validate_event(event: &RecordEvent) -> Result<()> {
    const MAX_TEXT_LENGTH: usize = 64 * 1024;
    const MAX_TYPE_LENGTH: usize = 50;

    if event.event_type.is_empty() || event.event_type.len() > MAX_TYPE_LENGTH {
        return Err(EventError::ValidationError(format!(
            "event_type must be 1..={} chars",
            MAX_TYPE_LENGTH
        )));
    }

    if event.text.len() > MAX_TEXT_LENGTH {
        return Err(EventError::ValidationError(format!(
            "event text too long (max: {} bytes)",
            MAX_TEXT_LENGTH
        )));
    }

    Ok(())
}
