//! AutomationStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::{
    Event, EventId, NewEvent, NewQueueEntry, NewRun, NewStepResult, NewWorkflow, QueueEntry,
    QueueEntryId, QueueStatus, RunId, RunOutcome, RunRecord, StepDefinition, StepId,
    StepResultId, StepResultRecord, Workflow, WorkflowId,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    /// Step definition not found
    #[error("step not found: {0}")]
    StepNotFound(StepId),

    /// Queue entry not found
    #[error("queue entry not found: {0}")]
    QueueEntryNotFound(QueueEntryId),

    /// Run record not found
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// An entry without execution time already exists for the pair
    #[error("workflow {workflow_id} already has a queue entry for event {event_id}")]
    DuplicateQueueEntry {
        workflow_id: WorkflowId,
        event_id: EventId,
    },

    /// Step result record not found
    #[error("step result not found: {0}")]
    StepResultNotFound(StepResultId),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result of [`AutomationStore::insert_event`]
#[derive(Debug, Clone, PartialEq)]
pub struct InsertedEvent {
    pub event: Event,

    /// False when an event with the same idempotency key already existed
    pub created: bool,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Persistence for workflows, events, the queue and run history
///
/// Implementations must be thread-safe. The engine itself is a single writer:
/// it never processes two queue entries at once, so implementations only
/// need to guard the queue builder against concurrent invocation.
#[async_trait]
pub trait AutomationStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a workflow and its steps; step order follows the input order
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<Workflow, StoreError>;

    /// Get a workflow with its ordered steps
    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError>;

    /// List all workflows, ordered by id
    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Enable or disable a workflow
    async fn set_workflow_enabled(
        &self,
        workflow_id: WorkflowId,
        enabled: bool,
    ) -> Result<(), StoreError>;

    /// Record that a run of the workflow was attempted
    async fn touch_workflow(
        &self,
        workflow_id: WorkflowId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Get a single step definition
    async fn get_step(&self, step_id: StepId) -> Result<StepDefinition, StoreError>;

    /// Replace a step's configuration
    async fn update_step_config(
        &self,
        step_id: StepId,
        config: Value,
    ) -> Result<StepDefinition, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Persist an event snapshot
    ///
    /// When the event carries an idempotency key that was already stored,
    /// the existing event is returned and nothing is written.
    async fn insert_event(&self, event: NewEvent) -> Result<InsertedEvent, StoreError>;

    /// Get an event snapshot; `None` once retention removed it
    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError>;

    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Queue every event that an active, non-realtime workflow subscribes to
    /// and that has no queue entry for that workflow yet
    ///
    /// Atomic: concurrent calls never produce two entries for one
    /// (workflow, event) pair. Returns the ids of the created entries.
    async fn enqueue_unqueued_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntryId>, StoreError>;

    /// Insert a queue entry outside any step transaction
    ///
    /// Fails with [`StoreError::DuplicateQueueEntry`] when the entry has no
    /// execution time and the pair already has one such entry.
    async fn insert_queue_entry(&self, entry: NewQueueEntry) -> Result<QueueEntryId, StoreError>;

    /// Ready entries of active workflows with `tries < max_tries` that are
    /// due at `now`, oldest first (creation time, then id), at most `limit`
    async fn select_due_entries(
        &self,
        now: DateTime<Utc>,
        max_tries: u32,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    /// Get a queue entry
    async fn get_queue_entry(&self, entry_id: QueueEntryId) -> Result<QueueEntry, StoreError>;

    /// Count an attempt: increments `tries` and returns the updated entry
    async fn begin_attempt(
        &self,
        entry_id: QueueEntryId,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError>;

    /// Store the outcome of an attempt
    async fn finish_attempt(
        &self,
        entry_id: QueueEntryId,
        status: QueueStatus,
        last_step_attempted: Option<StepId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Ready entries of a workflow with `tries < max_tries` joined with
    /// their events, oldest first
    ///
    /// Entries whose event is gone are left out.
    async fn list_ready_entries_with_events(
        &self,
        workflow_id: WorkflowId,
        max_tries: u32,
    ) -> Result<Vec<(QueueEntry, Event)>, StoreError>;

    /// All entries of a workflow in any status, oldest first
    async fn list_queue_entries(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<QueueEntry>, StoreError>;

    // =========================================================================
    // History Operations
    // =========================================================================

    /// Open a run; its number is one more than the highest for (workflow, event)
    async fn create_run(&self, run: NewRun) -> Result<RunRecord, StoreError>;

    /// Get a run record
    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StoreError>;

    /// Replace a run's outcome
    async fn update_run_outcome(&self, run_id: RunId, outcome: RunOutcome)
        -> Result<(), StoreError>;

    /// All runs of a workflow, by id
    async fn list_runs(&self, workflow_id: WorkflowId) -> Result<Vec<RunRecord>, StoreError>;

    /// Get a step result record
    async fn get_step_result(
        &self,
        result_id: StepResultId,
    ) -> Result<StepResultRecord, StoreError>;

    /// All step results of a run, by sequence
    async fn list_step_results(&self, run_id: RunId)
        -> Result<Vec<StepResultRecord>, StoreError>;

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction scope for one step execution
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    // =========================================================================
    // Retention
    // =========================================================================

    /// Delete events created before `older_than` that no ready entry references
    async fn purge_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete terminal queue entries last modified before `older_than` whose
    /// event no longer exists
    ///
    /// Entries stay while their event exists; they mark the pair as queued.
    async fn purge_queue_entries(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete runs created before `older_than`, with their step results
    async fn purge_runs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Write scope for a single step execution
///
/// Writes become visible on [`commit`](StoreTransaction::commit). Dropping an
/// uncommitted transaction discards them.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Insert a queue entry; uniqueness as in [`AutomationStore::insert_queue_entry`]
    async fn insert_queue_entry(&mut self, entry: NewQueueEntry)
        -> Result<QueueEntryId, StoreError>;

    /// Change a queue entry's status
    async fn set_queue_status(
        &mut self,
        entry_id: QueueEntryId,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Insert a run record; the number is assigned as in [`AutomationStore::create_run`]
    async fn insert_run(&mut self, run: NewRun) -> Result<RunId, StoreError>;

    /// Append a step result to its run's log
    async fn append_step_result(&mut self, result: NewStepResult)
        -> Result<StepResultId, StoreError>;

    /// Make the writes visible
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard the writes
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
