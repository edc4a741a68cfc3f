//! PostgreSQL repository
//!
//! State transitions are single conditional UPDATE statements; priority
//! recomputation locks the Work Item row for the duration of the read and
//! write so concurrent recomputations serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral_core::domain::{
    Event, ExecutionSpec, Request, RequestState, ResourceConstraints, SchedulingHints, WorkItem,
    WorkItemState,
};
use sqlx::{PgExecutor, PgPool};
use sqlx::types::Json;
use uuid::Uuid;

use super::{PriorityChange, RepoError, Repository, Result, Transition};

const REQUEST_COLUMNS: &str = r#"
    id, name, state, priority, work_item_id, requesting_work_item_id,
    runtime_constraints, scheduling, spec, use_existing, created_at, modified_at
"#;

const WORK_ITEM_COLUMNS: &str = r#"
    id, state, priority, locked_by, runtime_constraints, scheduling, spec,
    fingerprint, output, log, exit_code, created_at, modified_at
"#;

/// Repository backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn insert_request(&self, request: &Request) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO requests (id, name, state, priority, work_item_id, requesting_work_item_id,
                                  runtime_constraints, scheduling, spec, use_existing,
                                  created_at, modified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(request.id)
        .bind(&request.name)
        .bind(request.state.as_str())
        .bind(request.priority)
        .bind(request.work_item_id)
        .bind(request.requesting_work_item_id)
        .bind(Json(&request.runtime_constraints))
        .bind(Json(&request.scheduling))
        .bind(Json(&request.spec))
        .bind(request.use_existing)
        .bind(request.created_at)
        .bind(request.modified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_request(&self, request: &Request) -> Result<()> {
        write_request(&self.pool, request).await
    }

    async fn find_request(&self, id: Uuid) -> Result<Option<Request>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM requests WHERE id = $1",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Request::try_from).transpose()
    }

    async fn find_committed_requests_for(&self, work_item_id: Uuid) -> Result<Vec<Request>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM requests WHERE work_item_id = $1 AND state = 'Committed'",
            REQUEST_COLUMNS
        ))
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Request::try_from).collect()
    }

    async fn find_committed_children_of(&self, work_item_id: Uuid) -> Result<Vec<Request>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM requests WHERE requesting_work_item_id = $1 AND state = 'Committed'",
            REQUEST_COLUMNS
        ))
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Request::try_from).collect()
    }

    async fn attach_request(&self, request: &Request, new_item: Option<&WorkItem>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(item) = new_item {
            write_work_item(&mut *tx, item).await?;
        }
        write_request(&mut *tx, request).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_work_item(&self, item: &WorkItem) -> Result<()> {
        write_work_item(&self.pool, item).await
    }

    async fn find_work_item(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {} FROM work_items WHERE id = $1",
            WORK_ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItem::try_from).transpose()
    }

    async fn find_reusable_work_item(&self, fingerprint: &str) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            r#"
            SELECT {} FROM work_items
            WHERE fingerprint = $1
              AND (state IN ('Queued', 'Locked', 'Running')
                   OR (state = 'Complete' AND exit_code = 0 AND output IS NOT NULL))
            ORDER BY CASE state
                         WHEN 'Complete' THEN 0
                         WHEN 'Running' THEN 1
                         WHEN 'Locked' THEN 2
                         ELSE 3
                     END,
                     created_at ASC
            LIMIT 1
            "#,
            WORK_ITEM_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItem::try_from).transpose()
    }

    async fn list_work_items(&self, states: &[WorkItemState]) -> Result<Vec<WorkItem>> {
        let states: Vec<&str> = if states.is_empty() {
            WorkItemState::ALL.iter().map(|s| s.as_str()).collect()
        } else {
            states.iter().map(|s| s.as_str()).collect()
        };

        let rows = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {} FROM work_items WHERE state = ANY($1) ORDER BY priority DESC, created_at ASC",
            WORK_ITEM_COLUMNS
        ))
        .bind(&states)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WorkItem::try_from).collect()
    }

    async fn transition_work_item(
        &self,
        id: Uuid,
        expected: WorkItemState,
        transition: &Transition,
    ) -> Result<Option<WorkItem>> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            r#"
            UPDATE work_items
            SET state = $3, locked_by = $4, exit_code = $5, output = $6, log = $7,
                modified_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING {}
            "#,
            WORK_ITEM_COLUMNS
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(transition.state.as_str())
        .bind(&transition.locked_by)
        .bind(transition.exit_code)
        .bind(&transition.output)
        .bind(&transition.log)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkItem::try_from).transpose()
    }

    async fn recompute_priority(&self, id: Uuid) -> Result<Option<PriorityChange>> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<(i64,)> =
            sqlx::query_as("SELECT priority FROM work_items WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((previous,)) = previous else {
            return Ok(None);
        };

        let (priority, committed): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(CASE WHEN priority > 0 THEN priority END), 0)::BIGINT,
                   COUNT(*)
            FROM requests
            WHERE work_item_id = $1 AND state = 'Committed'
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            r#"
            UPDATE work_items
            SET priority = $2,
                modified_at = CASE WHEN priority = $2 THEN modified_at ELSE NOW() END
            WHERE id = $1
            RETURNING {}
            "#,
            WORK_ITEM_COLUMNS
        ))
        .bind(id)
        .bind(priority)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(PriorityChange {
            previous,
            committed_requests: committed as usize,
            item: WorkItem::try_from(row)?,
        }))
    }

    async fn find_priority_mismatches(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT w.id
            FROM work_items w
            LEFT JOIN (
                SELECT work_item_id,
                       COUNT(*) AS committed,
                       COALESCE(MAX(CASE WHEN priority > 0 THEN priority END), 0) AS derived
                FROM requests
                WHERE state = 'Committed'
                GROUP BY work_item_id
            ) r ON r.work_item_id = w.id
            WHERE w.state IN ('Queued', 'Locked', 'Running')
              AND (w.priority <> COALESCE(r.derived, 0)
                   OR (w.state = 'Queued' AND r.committed IS NULL))
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn insert_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO work_item_events (work_item_id, timestamp, event_type, text)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.work_item_id)
        .bind(event.timestamp)
        .bind(&event.event_type)
        .bind(&event.text)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_events(&self, work_item_id: Uuid) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT work_item_id, timestamp, event_type, text
            FROM work_item_events
            WHERE work_item_id = $1
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(work_item_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Event::from).collect())
    }
}

// =============================================================================
// Shared writes
// =============================================================================

async fn write_work_item<'e>(executor: impl PgExecutor<'e>, item: &WorkItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO work_items (id, state, priority, locked_by, runtime_constraints,
                                scheduling, spec, fingerprint, output, log, exit_code,
                                created_at, modified_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(item.id)
    .bind(item.state.as_str())
    .bind(item.priority)
    .bind(&item.locked_by)
    .bind(Json(&item.runtime_constraints))
    .bind(Json(&item.scheduling))
    .bind(Json(&item.spec))
    .bind(&item.fingerprint)
    .bind(&item.output)
    .bind(&item.log)
    .bind(item.exit_code)
    .bind(item.created_at)
    .bind(item.modified_at)
    .execute(executor)
    .await?;

    Ok(())
}

async fn write_request<'e>(executor: impl PgExecutor<'e>, request: &Request) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE requests
        SET name = $2, state = $3, priority = $4, work_item_id = $5, modified_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(request.id)
    .bind(&request.name)
    .bind(request.state.as_str())
    .bind(request.priority)
    .bind(request.work_item_id)
    .execute(executor)
    .await?;

    Ok(())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    name: Option<String>,
    state: String,
    priority: Option<i64>,
    work_item_id: Option<Uuid>,
    requesting_work_item_id: Option<Uuid>,
    runtime_constraints: Json<ResourceConstraints>,
    scheduling: Json<SchedulingHints>,
    spec: Json<ExecutionSpec>,
    use_existing: bool,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for Request {
    type Error = RepoError;

    fn try_from(row: RequestRow) -> Result<Self> {
        let state = row
            .state
            .parse::<RequestState>()
            .map_err(RepoError::Corrupt)?;

        Ok(Request {
            id: row.id,
            name: row.name,
            state,
            priority: row.priority,
            work_item_id: row.work_item_id,
            requesting_work_item_id: row.requesting_work_item_id,
            runtime_constraints: row.runtime_constraints.0,
            scheduling: row.scheduling.0,
            spec: row.spec.0,
            use_existing: row.use_existing,
            created_at: row.created_at,
            modified_at: row.modified_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    state: String,
    priority: i64,
    locked_by: Option<String>,
    runtime_constraints: Json<ResourceConstraints>,
    scheduling: Json<SchedulingHints>,
    spec: Json<ExecutionSpec>,
    fingerprint: String,
    output: Option<String>,
    log: Option<String>,
    exit_code: Option<i32>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = RepoError;

    fn try_from(row: WorkItemRow) -> Result<Self> {
        let state = row
            .state
            .parse::<WorkItemState>()
            .map_err(RepoError::Corrupt)?;

        Ok(WorkItem {
            id: row.id,
            state,
            priority: row.priority,
            locked_by: row.locked_by,
            runtime_constraints: row.runtime_constraints.0,
            scheduling: row.scheduling.0,
            spec: row.spec.0,
            fingerprint: row.fingerprint,
            output: row.output,
            log: row.log,
            exit_code: row.exit_code,
            created_at: row.created_at,
            modified_at: row.modified_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    work_item_id: Uuid,
    timestamp: DateTime<Utc>,
    event_type: String,
    text: String,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            work_item_id: row.work_item_id,
            timestamp: row.timestamp,
            event_type: row.event_type,
            text: row.text,
        }
    }
}
