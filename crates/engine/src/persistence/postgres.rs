//! PostgreSQL implementation of AutomationStore
//!
//! Production persistence using PostgreSQL with:
//! - A partial unique index guarding the queue builder against duplicates
//! - `sqlx` transactions as step scopes (dropped = rolled back)
//! - JSONB columns for configuration, result maps and event snapshots

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::model::{
    Event, EventContext, EventId, NewEvent, NewQueueEntry, NewRun, NewStepResult, NewWorkflow,
    QueueEntry, QueueEntryId, QueueStatus, RunId, RunOutcome, RunRecord, StepDefinition, StepId,
    StepResultId, StepResultRecord, Workflow, WorkflowId,
};

const WORKFLOW_COLUMNS: &str =
    "id, name, description, event_name, enabled, draft, realtime, debug, last_triggered";
const STEP_COLUMNS: &str =
    "id, workflow_id, kind, step_type, step_order, name, description, config";
const EVENT_COLUMNS: &str =
    "id, name, component, context_id, user_id, related_user_id, origin, fields, time_created";
const QUEUE_COLUMNS: &str = "id, workflow_id, event_id, status, tries, last_step_attempted, \
                             execution_time, time_created, time_modified";
const RUN_COLUMNS: &str = "id, workflow_id, event_id, number, event, outcome, time_created";
const STEP_RESULT_COLUMNS: &str = "id, run_id, sequence, step_id, previous_id, derived_from, \
                                   step_snapshot, results, executed_at";

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Attempt counts are INTEGER columns; larger limits saturate
fn tries_param(tries: u32) -> i32 {
    i32::try_from(tries).unwrap_or(i32::MAX)
}

/// PostgreSQL implementation of AutomationStore
///
/// # Example
///
/// ```ignore
/// use tripwire_engine::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/tripwire").await?;
/// let store = PostgresStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a default pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn load_steps(
        &self,
        workflow_ids: &[WorkflowId],
    ) -> Result<HashMap<WorkflowId, Vec<StepDefinition>>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM tripwire_steps \
             WHERE workflow_id = ANY($1) ORDER BY workflow_id, step_order"
        ))
        .bind(workflow_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let mut steps: HashMap<WorkflowId, Vec<StepDefinition>> = HashMap::new();
        for row in rows {
            let step = step_from_row(&row)?;
            steps.entry(step.workflow_id).or_default().push(step);
        }
        Ok(steps)
    }
}

#[async_trait]
impl AutomationStore for PostgresStore {
    #[instrument(skip(self, workflow), fields(name = %workflow.name))]
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<Workflow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row = sqlx::query(&format!(
            "INSERT INTO tripwire_workflows \
             (name, description, event_name, enabled, draft, realtime, debug) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {WORKFLOW_COLUMNS}"
        ))
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.event_name)
        .bind(workflow.enabled)
        .bind(workflow.draft)
        .bind(workflow.realtime)
        .bind(workflow.debug)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create workflow: {}", e);
            db_error(e)
        })?;
        let workflow_id: WorkflowId = row.get("id");

        let mut steps = Vec::with_capacity(workflow.steps.len());
        for (index, step) in workflow.steps.into_iter().enumerate() {
            let row = sqlx::query(&format!(
                "INSERT INTO tripwire_steps \
                 (workflow_id, kind, step_type, step_order, name, description, config) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {STEP_COLUMNS}"
            ))
            .bind(workflow_id)
            .bind(step.kind.as_str())
            .bind(&step.step_type)
            .bind(index as i32)
            .bind(&step.name)
            .bind(&step.description)
            .bind(&step.config)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;
            steps.push(step_from_row(&row)?);
        }

        tx.commit().await.map_err(db_error)?;

        debug!(workflow_id, steps = steps.len(), "created workflow");
        workflow_from_row(&row, steps)
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM tripwire_workflows WHERE id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let mut steps = self.load_steps(&[workflow_id]).await?;
        workflow_from_row(&row, steps.remove(&workflow_id).unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM tripwire_workflows ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        let ids: Vec<WorkflowId> = rows.iter().map(|r| r.get("id")).collect();
        let mut steps = self.load_steps(&ids).await?;
        rows.iter()
            .map(|row| {
                let id: WorkflowId = row.get("id");
                workflow_from_row(row, steps.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn set_workflow_enabled(
        &self,
        workflow_id: WorkflowId,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tripwire_workflows SET enabled = $2 WHERE id = $1")
            .bind(workflow_id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn touch_workflow(
        &self,
        workflow_id: WorkflowId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE tripwire_workflows SET last_triggered = $2 WHERE id = $1")
                .bind(workflow_id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(workflow_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_step(&self, step_id: StepId) -> Result<StepDefinition, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM tripwire_steps WHERE id = $1"
        ))
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::StepNotFound(step_id))?;
        step_from_row(&row)
    }

    #[instrument(skip(self, config))]
    async fn update_step_config(
        &self,
        step_id: StepId,
        config: Value,
    ) -> Result<StepDefinition, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE tripwire_steps SET config = $2 WHERE id = $1 RETURNING {STEP_COLUMNS}"
        ))
        .bind(step_id)
        .bind(&config)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::StepNotFound(step_id))?;
        step_from_row(&row)
    }

    #[instrument(skip(self, event), fields(name = %event.name))]
    async fn insert_event(&self, event: NewEvent) -> Result<InsertedEvent, StoreError> {
        let fields = Value::Object(event.fields.clone());
        let inserted = sqlx::query(&format!(
            "INSERT INTO tripwire_events \
             (name, component, context_id, user_id, related_user_id, origin, fields, \
              idempotency_key, time_created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (idempotency_key) DO NOTHING \
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(&event.name)
        .bind(&event.context.component)
        .bind(event.context.context_id)
        .bind(event.context.user_id)
        .bind(event.context.related_user_id)
        .bind(&event.context.origin)
        .bind(&fields)
        .bind(&event.idempotency_key)
        .bind(event.time_created)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        if let Some(row) = inserted {
            return Ok(InsertedEvent {
                event: event_from_row(&row)?,
                created: true,
            });
        }

        // Conflict on the idempotency key: hand back the stored snapshot
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM tripwire_events WHERE idempotency_key = $1"
        ))
        .bind(&event.idempotency_key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(InsertedEvent {
            event: event_from_row(&row)?,
            created: false,
        })
    }

    #[instrument(skip(self))]
    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM tripwire_events WHERE id = $1"
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        row.as_ref().map(event_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn enqueue_unqueued_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntryId>, StoreError> {
        let rows = sqlx::query(
            r#"
            INSERT INTO tripwire_queue
                (workflow_id, event_id, status, tries, time_created, time_modified)
            SELECT w.id, e.id, 'ready', 0, $1, $1
            FROM tripwire_events e
            JOIN tripwire_workflows w ON w.event_name = e.name
            WHERE w.enabled AND NOT w.draft AND NOT w.realtime
              AND NOT EXISTS (
                  SELECT 1 FROM tripwire_queue q
                  WHERE q.workflow_id = w.id AND q.event_id = e.id
              )
            ORDER BY e.id, w.id
            ON CONFLICT (workflow_id, event_id) WHERE execution_time IS NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to build queue: {}", e);
            db_error(e)
        })?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    #[instrument(skip(self))]
    async fn insert_queue_entry(&self, entry: NewQueueEntry) -> Result<QueueEntryId, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        insert_queue_entry_on(&mut conn, entry).await
    }

    #[instrument(skip(self))]
    async fn select_due_entries(
        &self,
        now: DateTime<Utc>,
        max_tries: u32,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT q.id, q.workflow_id, q.event_id, q.status, q.tries, q.last_step_attempted,
                   q.execution_time, q.time_created, q.time_modified
            FROM tripwire_queue q
            JOIN tripwire_workflows w ON w.id = q.workflow_id
            WHERE q.status = 'ready'
              AND w.enabled AND NOT w.draft
              AND q.tries < $2
              AND (q.execution_time IS NULL OR q.execution_time <= $1)
            ORDER BY q.time_created, q.id
            LIMIT $3
            "#,
        )
        .bind(now)
        .bind(tries_param(max_tries))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(queue_entry_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_queue_entry(&self, entry_id: QueueEntryId) -> Result<QueueEntry, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM tripwire_queue WHERE id = $1"
        ))
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::QueueEntryNotFound(entry_id))?;
        queue_entry_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn begin_attempt(
        &self,
        entry_id: QueueEntryId,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE tripwire_queue SET tries = tries + 1, time_modified = $2 \
             WHERE id = $1 RETURNING {QUEUE_COLUMNS}"
        ))
        .bind(entry_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::QueueEntryNotFound(entry_id))?;
        queue_entry_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn finish_attempt(
        &self,
        entry_id: QueueEntryId,
        status: QueueStatus,
        last_step_attempted: Option<StepId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE tripwire_queue \
             SET status = $2, last_step_attempted = $3, time_modified = $4 \
             WHERE id = $1",
        )
        .bind(entry_id)
        .bind(status.as_str())
        .bind(last_step_attempted)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::QueueEntryNotFound(entry_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_ready_entries_with_events(
        &self,
        workflow_id: WorkflowId,
        max_tries: u32,
    ) -> Result<Vec<(QueueEntry, Event)>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM tripwire_queue \
             WHERE workflow_id = $1 AND status = 'ready' AND tries < $2 \
             ORDER BY time_created, id"
        ))
        .bind(workflow_id)
        .bind(tries_param(max_tries))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let entries = rows
            .iter()
            .map(queue_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let event_ids: Vec<EventId> = entries.iter().map(|q| q.event_id).collect();
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM tripwire_events WHERE id = ANY($1)"
        ))
        .bind(&event_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        let mut events = HashMap::with_capacity(rows.len());
        for row in &rows {
            let event = event_from_row(row)?;
            events.insert(event.id, event);
        }

        Ok(entries
            .into_iter()
            .filter_map(|q| events.get(&q.event_id).cloned().map(|e| (q, e)))
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_queue_entries(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM tripwire_queue \
             WHERE workflow_id = $1 ORDER BY time_created, id"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(queue_entry_from_row).collect()
    }

    #[instrument(skip(self, run), fields(workflow_id = run.workflow_id, event_id = run.event.id))]
    async fn create_run(&self, run: NewRun) -> Result<RunRecord, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        let run_id = insert_run_on(&mut conn, run).await?;
        self.get_run(run_id).await
    }

    #[instrument(skip(self))]
    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM tripwire_runs WHERE id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::RunNotFound(run_id))?;
        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn update_run_outcome(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
    ) -> Result<(), StoreError> {
        let outcome = serde_json::to_value(outcome)?;
        let result = sqlx::query("UPDATE tripwire_runs SET outcome = $2 WHERE id = $1")
            .bind(run_id)
            .bind(&outcome)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_runs(&self, workflow_id: WorkflowId) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM tripwire_runs WHERE workflow_id = $1 ORDER BY id"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(run_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_step_result(
        &self,
        result_id: StepResultId,
    ) -> Result<StepResultRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {STEP_RESULT_COLUMNS} FROM tripwire_step_results WHERE id = $1"
        ))
        .bind(result_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::StepResultNotFound(result_id))?;
        step_result_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_step_results(
        &self,
        run_id: RunId,
    ) -> Result<Vec<StepResultRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_RESULT_COLUMNS} FROM tripwire_step_results \
             WHERE run_id = $1 ORDER BY sequence"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;
        rows.iter().map(step_result_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    #[instrument(skip(self))]
    async fn purge_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tripwire_events e
            WHERE e.time_created < $1
              AND NOT EXISTS (
                  SELECT 1 FROM tripwire_queue q
                  WHERE q.event_id = e.id AND q.status = 'ready'
              )
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn purge_queue_entries(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tripwire_queue q
            WHERE q.status <> 'ready'
              AND q.time_modified < $1
              AND NOT EXISTS (SELECT 1 FROM tripwire_events e WHERE e.id = q.event_id)
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn purge_runs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        // Step results go with their run (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM tripwire_runs WHERE time_created < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

/// Step scope backed by a `sqlx` transaction; dropping it rolls back
struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn insert_queue_entry(
        &mut self,
        entry: NewQueueEntry,
    ) -> Result<QueueEntryId, StoreError> {
        insert_queue_entry_on(&mut self.tx, entry).await
    }

    async fn set_queue_status(
        &mut self,
        entry_id: QueueEntryId,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE tripwire_queue SET status = $2, time_modified = $3 WHERE id = $1")
                .bind(entry_id)
                .bind(status.as_str())
                .bind(now)
                .execute(&mut *self.tx)
                .await
                .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::QueueEntryNotFound(entry_id));
        }
        Ok(())
    }

    async fn insert_run(&mut self, run: NewRun) -> Result<RunId, StoreError> {
        insert_run_on(&mut self.tx, run).await
    }

    async fn append_step_result(
        &mut self,
        result: NewStepResult,
    ) -> Result<StepResultId, StoreError> {
        let snapshot = serde_json::to_value(&result.step_snapshot)?;
        let results = Value::Object(result.results);
        let row = sqlx::query(
            r#"
            INSERT INTO tripwire_step_results
                (run_id, sequence, step_id, previous_id, derived_from, step_snapshot,
                 results, executed_at)
            SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3, $4, $5, $6, $7
            FROM tripwire_step_results
            WHERE run_id = $1
            RETURNING id
            "#,
        )
        .bind(result.run_id)
        .bind(result.step_id)
        .bind(result.previous_id)
        .bind(result.derived_from)
        .bind(&snapshot)
        .bind(&results)
        .bind(result.executed_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error)?;
        Ok(row.get("id"))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(db_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(db_error)
    }
}

// =============================================================================
// Shared statements
// =============================================================================

async fn insert_queue_entry_on(
    conn: &mut PgConnection,
    entry: NewQueueEntry,
) -> Result<QueueEntryId, StoreError> {
    let row = sqlx::query(
        r#"
        INSERT INTO tripwire_queue
            (workflow_id, event_id, status, tries, execution_time, time_created, time_modified)
        VALUES ($1, $2, $3, $4, $5, $6, $6)
        RETURNING id
        "#,
    )
    .bind(entry.workflow_id)
    .bind(entry.event_id)
    .bind(entry.status.as_str())
    .bind(tries_param(entry.tries))
    .bind(entry.execution_time)
    .bind(entry.time_created)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::DuplicateQueueEntry {
            workflow_id: entry.workflow_id,
            event_id: entry.event_id,
        },
        _ => db_error(e),
    })?;
    Ok(row.get("id"))
}

async fn insert_run_on(conn: &mut PgConnection, run: NewRun) -> Result<RunId, StoreError> {
    let event = serde_json::to_value(&run.event)?;
    let outcome = serde_json::to_value(run.outcome)?;
    let row = sqlx::query(
        r#"
        INSERT INTO tripwire_runs (workflow_id, event_id, number, event, outcome, time_created)
        SELECT $1, $2, COALESCE(MAX(number), 0) + 1, $3, $4, $5
        FROM tripwire_runs
        WHERE workflow_id = $1 AND event_id = $2
        RETURNING id
        "#,
    )
    .bind(run.workflow_id)
    .bind(run.event.id)
    .bind(&event)
    .bind(&outcome)
    .bind(run.time_created)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error)?;
    Ok(row.get("id"))
}

// =============================================================================
// Row mapping
// =============================================================================

fn workflow_from_row(row: &PgRow, steps: Vec<StepDefinition>) -> Result<Workflow, StoreError> {
    Ok(Workflow {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        event_name: row.get("event_name"),
        enabled: row.get("enabled"),
        draft: row.get("draft"),
        realtime: row.get("realtime"),
        debug: row.get("debug"),
        last_triggered: row.get("last_triggered"),
        steps,
    })
}

fn step_from_row(row: &PgRow) -> Result<StepDefinition, StoreError> {
    let kind: String = row.get("kind");
    Ok(StepDefinition {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        kind: kind.parse().map_err(StoreError::Serialization)?,
        step_type: row.get("step_type"),
        step_order: row.get("step_order"),
        name: row.get("name"),
        description: row.get("description"),
        config: row.get("config"),
    })
}

fn event_from_row(row: &PgRow) -> Result<Event, StoreError> {
    let fields: Value = row.get("fields");
    Ok(Event {
        id: row.get("id"),
        name: row.get("name"),
        context: EventContext {
            component: row.get("component"),
            context_id: row.get("context_id"),
            user_id: row.get("user_id"),
            related_user_id: row.get("related_user_id"),
            origin: row.get("origin"),
        },
        fields: into_object(fields),
        time_created: row.get("time_created"),
    })
}

fn queue_entry_from_row(row: &PgRow) -> Result<QueueEntry, StoreError> {
    let status: String = row.get("status");
    let tries: i32 = row.get("tries");
    Ok(QueueEntry {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        event_id: row.get("event_id"),
        status: status.parse().map_err(StoreError::Serialization)?,
        tries: tries.max(0) as u32,
        last_step_attempted: row.get("last_step_attempted"),
        execution_time: row.get("execution_time"),
        time_created: row.get("time_created"),
        time_modified: row.get("time_modified"),
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let event: Value = row.get("event");
    let outcome: Value = row.get("outcome");
    Ok(RunRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        event_id: row.get("event_id"),
        number: row.get("number"),
        event: serde_json::from_value(event)?,
        outcome: serde_json::from_value(outcome)?,
        time_created: row.get("time_created"),
    })
}

fn step_result_from_row(row: &PgRow) -> Result<StepResultRecord, StoreError> {
    let snapshot: Value = row.get("step_snapshot");
    let results: Value = row.get("results");
    Ok(StepResultRecord {
        id: row.get("id"),
        run_id: row.get("run_id"),
        sequence: row.get("sequence"),
        step_id: row.get("step_id"),
        previous_id: row.get("previous_id"),
        derived_from: row.get("derived_from"),
        step_snapshot: serde_json::from_value(snapshot)?,
        results: into_object(results),
        executed_at: row.get("executed_at"),
    })
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
