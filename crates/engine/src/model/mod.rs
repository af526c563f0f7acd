//! Engine data model
//!
//! This module contains the records the engine reads and writes:
//! - [`Event`] immutable snapshots of domain occurrences
//! - [`Workflow`] and [`StepDefinition`] for configured step chains
//! - [`QueueEntry`] for pending and completed (workflow, event) executions
//! - [`RunRecord`] and [`StepResultRecord`] for the append-only history

mod event;
mod history;
mod queue;
mod workflow;

pub use event::{Event, EventContext, EventId, NewEvent};
pub use history::{
    NewRun, NewStepResult, ResultMap, RunId, RunOutcome, RunRecord, StepMarker, StepResultId,
    StepResultRecord,
};
pub use queue::{NewQueueEntry, QueueEntry, QueueEntryId, QueueStatus};
pub use workflow::{
    NewStepDefinition, NewWorkflow, StepDefinition, StepId, StepKind, Workflow, WorkflowId,
};
