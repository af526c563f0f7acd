//! In-memory implementation of AutomationStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::store::*;
use crate::model::{
    Event, EventId, NewEvent, NewQueueEntry, NewRun, NewStepResult, NewWorkflow, QueueEntry,
    QueueEntryId, QueueStatus, RunId, RunOutcome, RunRecord, StepDefinition, StepId,
    StepResultId, StepResultRecord, Workflow, WorkflowId,
};

/// Id sequences, one per table
#[derive(Default)]
struct Sequences {
    workflow: AtomicI64,
    step: AtomicI64,
    event: AtomicI64,
    queue: AtomicI64,
    run: AtomicI64,
    step_result: AtomicI64,
}

fn next_id(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::SeqCst) + 1
}

#[derive(Default)]
struct MemoryState {
    workflows: BTreeMap<WorkflowId, Workflow>,
    events: BTreeMap<EventId, Event>,
    idempotency_keys: HashMap<String, EventId>,
    queue: BTreeMap<QueueEntryId, QueueEntry>,
    runs: BTreeMap<RunId, RunRecord>,
    step_results: BTreeMap<StepResultId, StepResultRecord>,
}

impl MemoryState {
    fn step(&self, step_id: StepId) -> Option<&StepDefinition> {
        self.workflows
            .values()
            .flat_map(|w| w.steps.iter())
            .find(|s| s.id == step_id)
    }

    fn is_active(&self, workflow_id: WorkflowId) -> bool {
        self.workflows
            .get(&workflow_id)
            .is_some_and(Workflow::is_active)
    }

    /// Whether the pair already has an entry without execution time
    fn has_original(&self, workflow_id: WorkflowId, event_id: EventId) -> bool {
        self.queue.values().any(|q| {
            q.workflow_id == workflow_id && q.event_id == event_id && q.execution_time.is_none()
        })
    }

    fn check_unique(&self, entry: &NewQueueEntry) -> Result<(), StoreError> {
        if entry.execution_time.is_none() && self.has_original(entry.workflow_id, entry.event_id)
        {
            return Err(StoreError::DuplicateQueueEntry {
                workflow_id: entry.workflow_id,
                event_id: entry.event_id,
            });
        }
        Ok(())
    }

    fn insert_queue_entry(&mut self, id: QueueEntryId, entry: NewQueueEntry) {
        self.queue.insert(
            id,
            QueueEntry {
                id,
                workflow_id: entry.workflow_id,
                event_id: entry.event_id,
                status: entry.status,
                tries: entry.tries,
                last_step_attempted: None,
                execution_time: entry.execution_time,
                time_created: entry.time_created,
                time_modified: entry.time_created,
            },
        );
    }

    fn insert_run(&mut self, id: RunId, run: NewRun) -> RunRecord {
        let number = self
            .runs
            .values()
            .filter(|r| r.workflow_id == run.workflow_id && r.event_id == run.event.id)
            .map(|r| r.number)
            .max()
            .unwrap_or(0)
            + 1;
        let record = RunRecord {
            id,
            workflow_id: run.workflow_id,
            event_id: run.event.id,
            number,
            event: run.event,
            outcome: run.outcome,
            time_created: run.time_created,
        };
        self.runs.insert(id, record.clone());
        record
    }

    fn append_step_result(&mut self, id: StepResultId, result: NewStepResult) {
        let sequence = self
            .step_results
            .values()
            .filter(|r| r.run_id == result.run_id)
            .map(|r| r.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        self.step_results.insert(
            id,
            StepResultRecord {
                id,
                run_id: result.run_id,
                sequence,
                step_id: result.step_id,
                previous_id: result.previous_id,
                derived_from: result.derived_from,
                step_snapshot: result.step_snapshot,
                results: result.results,
                executed_at: result.executed_at,
            },
        );
    }
}

struct Shared {
    state: RwLock<MemoryState>,
    ids: Sequences,
}

/// In-memory implementation of AutomationStore
///
/// Used by tests and by the worker when no database is configured. It
/// provides the same semantics as the PostgreSQL implementation, including
/// transactions that only become visible on commit.
///
/// # Example
///
/// ```
/// use tripwire_engine::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// assert_eq!(store.queue_len(), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(MemoryState::default()),
                ids: Sequences::default(),
            }),
        }
    }

    /// Number of queue entries in any status
    pub fn queue_len(&self) -> usize {
        self.shared.state.read().queue.len()
    }

    /// Number of stored events
    pub fn event_count(&self) -> usize {
        self.shared.state.read().events.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.shared.state.write() = MemoryState::default();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationStore for InMemoryStore {
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<Workflow, StoreError> {
        let id = next_id(&self.shared.ids.workflow);
        let steps = workflow
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| StepDefinition {
                id: next_id(&self.shared.ids.step),
                workflow_id: id,
                kind: step.kind,
                step_type: step.step_type,
                step_order: index as i32,
                name: step.name,
                description: step.description,
                config: step.config,
            })
            .collect();

        let created = Workflow {
            id,
            name: workflow.name,
            description: workflow.description,
            event_name: workflow.event_name,
            enabled: workflow.enabled,
            draft: workflow.draft,
            realtime: workflow.realtime,
            debug: workflow.debug,
            last_triggered: None,
            steps,
        };
        self.shared.state.write().workflows.insert(id, created.clone());
        Ok(created)
    }

    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, StoreError> {
        self.shared
            .state
            .read()
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.shared.state.read().workflows.values().cloned().collect())
    }

    async fn set_workflow_enabled(
        &self,
        workflow_id: WorkflowId,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.enabled = enabled;
        Ok(())
    }

    async fn touch_workflow(
        &self,
        workflow_id: WorkflowId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        workflow.last_triggered = Some(now);
        Ok(())
    }

    async fn get_step(&self, step_id: StepId) -> Result<StepDefinition, StoreError> {
        self.shared
            .state
            .read()
            .step(step_id)
            .cloned()
            .ok_or(StoreError::StepNotFound(step_id))
    }

    async fn update_step_config(
        &self,
        step_id: StepId,
        config: Value,
    ) -> Result<StepDefinition, StoreError> {
        let mut state = self.shared.state.write();
        let step = state
            .workflows
            .values_mut()
            .flat_map(|w| w.steps.iter_mut())
            .find(|s| s.id == step_id)
            .ok_or(StoreError::StepNotFound(step_id))?;
        step.config = config;
        Ok(step.clone())
    }

    async fn insert_event(&self, event: NewEvent) -> Result<InsertedEvent, StoreError> {
        let mut state = self.shared.state.write();
        if let Some(key) = &event.idempotency_key {
            if let Some(existing) = state
                .idempotency_keys
                .get(key)
                .and_then(|id| state.events.get(id))
            {
                return Ok(InsertedEvent {
                    event: existing.clone(),
                    created: false,
                });
            }
        }

        let id = next_id(&self.shared.ids.event);
        let key = event.idempotency_key.clone();
        let stored = event.into_event(id);
        state.events.insert(id, stored.clone());
        if let Some(key) = key {
            state.idempotency_keys.insert(key, id);
        }
        Ok(InsertedEvent {
            event: stored,
            created: true,
        })
    }

    async fn get_event(&self, event_id: EventId) -> Result<Option<Event>, StoreError> {
        Ok(self.shared.state.read().events.get(&event_id).cloned())
    }

    async fn enqueue_unqueued_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntryId>, StoreError> {
        // The write lock makes the check-then-insert atomic
        let mut state = self.shared.state.write();

        let mut pairs = Vec::new();
        for workflow in state.workflows.values() {
            if !workflow.is_active() || workflow.realtime {
                continue;
            }
            for event in state.events.values() {
                if event.name != workflow.event_name {
                    continue;
                }
                let queued = state
                    .queue
                    .values()
                    .any(|q| q.workflow_id == workflow.id && q.event_id == event.id);
                if !queued {
                    pairs.push((workflow.id, event.id));
                }
            }
        }

        // Event order keeps creation order across workflows
        pairs.sort_by_key(|&(workflow_id, event_id)| (event_id, workflow_id));

        let mut created = Vec::with_capacity(pairs.len());
        for (workflow_id, event_id) in pairs {
            let id = next_id(&self.shared.ids.queue);
            state.insert_queue_entry(id, NewQueueEntry::ready(workflow_id, event_id, now));
            created.push(id);
        }
        Ok(created)
    }

    async fn insert_queue_entry(&self, entry: NewQueueEntry) -> Result<QueueEntryId, StoreError> {
        let mut state = self.shared.state.write();
        state.check_unique(&entry)?;
        let id = next_id(&self.shared.ids.queue);
        state.insert_queue_entry(id, entry);
        Ok(id)
    }

    async fn select_due_entries(
        &self,
        now: DateTime<Utc>,
        max_tries: u32,
        limit: usize,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let state = self.shared.state.read();
        let mut due: Vec<QueueEntry> = state
            .queue
            .values()
            .filter(|q| {
                q.status == QueueStatus::Ready
                    && q.tries < max_tries
                    && q.is_due(now)
                    && state.is_active(q.workflow_id)
            })
            .cloned()
            .collect();
        due.sort_by_key(|q| (q.time_created, q.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn get_queue_entry(&self, entry_id: QueueEntryId) -> Result<QueueEntry, StoreError> {
        self.shared
            .state
            .read()
            .queue
            .get(&entry_id)
            .cloned()
            .ok_or(StoreError::QueueEntryNotFound(entry_id))
    }

    async fn begin_attempt(
        &self,
        entry_id: QueueEntryId,
        now: DateTime<Utc>,
    ) -> Result<QueueEntry, StoreError> {
        let mut state = self.shared.state.write();
        let entry = state
            .queue
            .get_mut(&entry_id)
            .ok_or(StoreError::QueueEntryNotFound(entry_id))?;
        entry.tries += 1;
        entry.time_modified = now;
        Ok(entry.clone())
    }

    async fn finish_attempt(
        &self,
        entry_id: QueueEntryId,
        status: QueueStatus,
        last_step_attempted: Option<StepId>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let entry = state
            .queue
            .get_mut(&entry_id)
            .ok_or(StoreError::QueueEntryNotFound(entry_id))?;
        entry.status = status;
        entry.last_step_attempted = last_step_attempted;
        entry.time_modified = now;
        Ok(())
    }

    async fn list_ready_entries_with_events(
        &self,
        workflow_id: WorkflowId,
        max_tries: u32,
    ) -> Result<Vec<(QueueEntry, Event)>, StoreError> {
        let state = self.shared.state.read();
        let mut entries: Vec<(QueueEntry, Event)> = state
            .queue
            .values()
            .filter(|q| {
                q.workflow_id == workflow_id
                    && q.status == QueueStatus::Ready
                    && q.tries < max_tries
            })
            .filter_map(|q| {
                state
                    .events
                    .get(&q.event_id)
                    .map(|e| (q.clone(), e.clone()))
            })
            .collect();
        entries.sort_by_key(|(q, _)| (q.time_created, q.id));
        Ok(entries)
    }

    async fn list_queue_entries(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let state = self.shared.state.read();
        let mut entries: Vec<QueueEntry> = state
            .queue
            .values()
            .filter(|q| q.workflow_id == workflow_id)
            .cloned()
            .collect();
        entries.sort_by_key(|q| (q.time_created, q.id));
        Ok(entries)
    }

    async fn create_run(&self, run: NewRun) -> Result<RunRecord, StoreError> {
        let id = next_id(&self.shared.ids.run);
        Ok(self.shared.state.write().insert_run(id, run))
    }

    async fn get_run(&self, run_id: RunId) -> Result<RunRecord, StoreError> {
        self.shared
            .state
            .read()
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn update_run_outcome(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
    ) -> Result<(), StoreError> {
        let mut state = self.shared.state.write();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        run.outcome = outcome;
        Ok(())
    }

    async fn list_runs(&self, workflow_id: WorkflowId) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self
            .shared
            .state
            .read()
            .runs
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_step_result(
        &self,
        result_id: StepResultId,
    ) -> Result<StepResultRecord, StoreError> {
        self.shared
            .state
            .read()
            .step_results
            .get(&result_id)
            .cloned()
            .ok_or(StoreError::StepResultNotFound(result_id))
    }

    async fn list_step_results(
        &self,
        run_id: RunId,
    ) -> Result<Vec<StepResultRecord>, StoreError> {
        let state = self.shared.state.read();
        let mut results: Vec<StepResultRecord> = state
            .step_results
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.sequence);
        Ok(results)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            writes: Vec::new(),
            closed: false,
        }))
    }

    async fn purge_events(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.shared.state.write();
        let referenced: Vec<EventId> = state
            .queue
            .values()
            .filter(|q| q.status == QueueStatus::Ready)
            .map(|q| q.event_id)
            .collect();
        let before = state.events.len();
        state
            .events
            .retain(|id, e| e.time_created >= older_than || referenced.contains(id));
        let MemoryState {
            events,
            idempotency_keys,
            ..
        } = &mut *state;
        idempotency_keys.retain(|_, id| events.contains_key(id));
        Ok((before - events.len()) as u64)
    }

    async fn purge_queue_entries(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.shared.state.write();
        let before = state.queue.len();
        let MemoryState { queue, events, .. } = &mut *state;
        queue.retain(|_, q| {
            !q.status.is_terminal()
                || q.time_modified >= older_than
                || events.contains_key(&q.event_id)
        });
        Ok((before - queue.len()) as u64)
    }

    async fn purge_runs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.shared.state.write();
        let before = state.runs.len();
        state.runs.retain(|_, r| r.time_created >= older_than);
        let MemoryState {
            runs, step_results, ..
        } = &mut *state;
        step_results.retain(|_, r| runs.contains_key(&r.run_id));
        Ok((before - runs.len()) as u64)
    }
}

/// A buffered write
enum PendingWrite {
    QueueEntry(QueueEntryId, NewQueueEntry),
    QueueStatus(QueueEntryId, QueueStatus, DateTime<Utc>),
    Run(RunId, NewRun),
    StepResult(StepResultId, NewStepResult),
}

/// Buffers writes and applies them under one write lock on commit
///
/// Ids are allocated eagerly so callers can reference them before commit;
/// a rolled back transaction leaves gaps in the sequences.
struct MemoryTransaction {
    shared: Arc<Shared>,
    writes: Vec<PendingWrite>,
    closed: bool,
}

impl MemoryTransaction {
    fn buffers_original(&self, entry: &NewQueueEntry) -> bool {
        self.writes.iter().any(|w| {
            matches!(w, PendingWrite::QueueEntry(_, e)
                if e.workflow_id == entry.workflow_id
                    && e.event_id == entry.event_id
                    && e.execution_time.is_none())
        })
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_queue_entry(
        &mut self,
        entry: NewQueueEntry,
    ) -> Result<QueueEntryId, StoreError> {
        self.shared.state.read().check_unique(&entry)?;
        if entry.execution_time.is_none() && self.buffers_original(&entry) {
            return Err(StoreError::DuplicateQueueEntry {
                workflow_id: entry.workflow_id,
                event_id: entry.event_id,
            });
        }
        let id = next_id(&self.shared.ids.queue);
        self.writes.push(PendingWrite::QueueEntry(id, entry));
        Ok(id)
    }

    async fn set_queue_status(
        &mut self,
        entry_id: QueueEntryId,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let buffered = self
            .writes
            .iter()
            .any(|w| matches!(w, PendingWrite::QueueEntry(id, _) if *id == entry_id));
        if !buffered && !self.shared.state.read().queue.contains_key(&entry_id) {
            return Err(StoreError::QueueEntryNotFound(entry_id));
        }
        self.writes
            .push(PendingWrite::QueueStatus(entry_id, status, now));
        Ok(())
    }

    async fn insert_run(&mut self, run: NewRun) -> Result<RunId, StoreError> {
        let id = next_id(&self.shared.ids.run);
        self.writes.push(PendingWrite::Run(id, run));
        Ok(id)
    }

    async fn append_step_result(
        &mut self,
        result: NewStepResult,
    ) -> Result<StepResultId, StoreError> {
        let id = next_id(&self.shared.ids.step_result);
        self.writes.push(PendingWrite::StepResult(id, result));
        Ok(id)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        let writes = std::mem::take(&mut tx.writes);
        tx.closed = true;

        let mut state = tx.shared.state.write();
        // Another writer may have claimed the pair since the insert was buffered
        for write in &writes {
            if let PendingWrite::QueueEntry(_, entry) = write {
                state.check_unique(entry)?;
            }
        }
        for write in writes {
            match write {
                PendingWrite::QueueEntry(id, entry) => state.insert_queue_entry(id, entry),
                PendingWrite::QueueStatus(id, status, now) => {
                    if let Some(entry) = state.queue.get_mut(&id) {
                        entry.status = status;
                        entry.time_modified = now;
                    }
                }
                PendingWrite::Run(id, run) => {
                    state.insert_run(id, run);
                }
                PendingWrite::StepResult(id, result) => state.append_step_result(id, result),
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.writes.clear();
        tx.closed = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.closed && !self.writes.is_empty() {
            debug!(
                writes = self.writes.len(),
                "discarding uncommitted transaction"
            );
        }
    }
}
