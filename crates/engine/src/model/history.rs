//! Run and step-result history
//!
//! History is append-only. A [`RunRecord`] is one logical execution of a
//! workflow against one event; each executed step appends a
//! [`StepResultRecord`] keyed by `(run_id, sequence)`.
//!
//! Two pointers live on every step result:
//! - `previous_id` is the pipeline predecessor (the record whose result map
//!   was the input of this one), null for the first step of a run
//! - `derived_from` is replay lineage, set when a record was produced by
//!   re-running another record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Event, EventId, StepDefinition, StepId, WorkflowId};

/// Accumulated result map threaded through a step chain
pub type ResultMap = Map<String, Value>;

/// Identifier of a run record
pub type RunId = i64;

/// Identifier of a step-result record
pub type StepResultId = i64;

/// Step a run stopped at, with its 1-based position in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMarker {
    pub step_id: StepId,
    pub position: usize,
}

/// Final (or current) state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Steps are still executing
    InProgress,

    /// Every step succeeded
    Succeeded,

    /// A step raised a transient error; the entry will be retried
    Errored { step: StepMarker },

    /// A step returned failure; the chain halted
    Failed { step: StepMarker },

    /// Superseded by another entry during debounce
    Cancelled { step: StepMarker },

    /// Handed over to a debounce clone
    Deferred { step: StepMarker },
}

impl RunOutcome {
    /// Status badge shown to administrators
    pub fn badge(&self) -> String {
        match self {
            Self::InProgress => "in progress".to_string(),
            Self::Succeeded => "success".to_string(),
            Self::Errored { step } => format!("error at step {}", step.position),
            Self::Failed { step } => format!("failed at step {}", step.position),
            Self::Cancelled { .. } => "cancelled".to_string(),
            Self::Deferred { .. } => "deferred".to_string(),
        }
    }

    /// Step the run stopped at, if any
    pub fn step(&self) -> Option<StepMarker> {
        match self {
            Self::InProgress | Self::Succeeded => None,
            Self::Errored { step }
            | Self::Failed { step }
            | Self::Cancelled { step }
            | Self::Deferred { step } => Some(*step),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Errored { .. })
    }
}

/// One logical execution of a workflow against one event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub event_id: EventId,

    /// Sequence number within (workflow, event), starting at 1
    pub number: i32,

    /// Triggering event snapshot
    pub event: Event,
    pub outcome: RunOutcome,
    pub time_created: DateTime<Utc>,
}

/// Run record to be inserted; the store assigns id and number
#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub workflow_id: WorkflowId,
    pub event: Event,
    pub outcome: RunOutcome,
    pub time_created: DateTime<Utc>,
}

impl NewRun {
    pub fn in_progress(workflow_id: WorkflowId, event: Event, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            event,
            outcome: RunOutcome::InProgress,
            time_created: now,
        }
    }

    pub fn with_outcome(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Result of one step execution within a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResultRecord {
    pub id: StepResultId,
    pub run_id: RunId,

    /// Position in the run's append-only log, starting at 1
    pub sequence: i32,
    pub step_id: StepId,

    /// Pipeline predecessor
    pub previous_id: Option<StepResultId>,

    /// Record this one re-executes, for replays
    pub derived_from: Option<StepResultId>,

    /// Step definition (configuration included) as it was at execution time
    pub step_snapshot: StepDefinition,
    pub results: ResultMap,
    pub executed_at: DateTime<Utc>,
}

/// Step result to be appended; the store assigns id and sequence
#[derive(Debug, Clone, PartialEq)]
pub struct NewStepResult {
    pub run_id: RunId,
    pub step_id: StepId,
    pub previous_id: Option<StepResultId>,
    pub derived_from: Option<StepResultId>,
    pub step_snapshot: StepDefinition,
    pub results: ResultMap,
    pub executed_at: DateTime<Utc>,
}
