use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Work items first: requests reference them
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_items (
            id UUID PRIMARY KEY,
            state VARCHAR(20) NOT NULL,
            priority BIGINT NOT NULL DEFAULT 0,
            locked_by VARCHAR(255),
            runtime_constraints JSONB NOT NULL,
            scheduling JSONB NOT NULL DEFAULT '{}',
            spec JSONB NOT NULL,
            fingerprint VARCHAR(64) NOT NULL,
            output TEXT,
            log TEXT,
            exit_code INTEGER,
            created_at TIMESTAMPTZ NOT NULL,
            modified_at TIMESTAMPTZ NOT NULL,
            CONSTRAINT locked_by_iff_locked CHECK (
                (state IN ('Locked', 'Running')) = (locked_by IS NOT NULL)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id UUID PRIMARY KEY,
            name VARCHAR(255),
            state VARCHAR(20) NOT NULL,
            priority BIGINT,
            work_item_id UUID REFERENCES work_items(id),
            requesting_work_item_id UUID REFERENCES work_items(id),
            runtime_constraints JSONB NOT NULL,
            scheduling JSONB NOT NULL DEFAULT '{}',
            spec JSONB NOT NULL,
            use_existing BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL,
            modified_at TIMESTAMPTZ NOT NULL,
            CONSTRAINT committed_priority CHECK (
                state <> 'Committed' OR (priority IS NOT NULL AND priority >= 0)
            )
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS work_item_events (
            id BIGSERIAL PRIMARY KEY,
            work_item_id UUID NOT NULL REFERENCES work_items(id) ON DELETE CASCADE,
            timestamp TIMESTAMPTZ NOT NULL,
            event_type VARCHAR(50) NOT NULL,
            text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the reconciliation queries
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_work_items_state ON work_items(state)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_work_items_fingerprint ON work_items(fingerprint)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_work_item ON requests(work_item_id, state)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_requests_requesting ON requests(requesting_work_item_id, state)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_events_work_item ON work_item_events(work_item_id, timestamp)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
