//! Queue entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventId, StepId, WorkflowId};

/// Identifier of a queue entry
pub type QueueEntryId = i64;

/// Lifecycle state of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be processed (or to be retried)
    Ready,

    /// Every step succeeded
    Finished,

    /// A step returned failure; not retried
    FinishedEarly,

    /// Superseded by another entry during debounce
    Cancelled,

    /// Handed over to a debounce clone that carries the future execution
    Deferred,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Finished => "finished",
            Self::FinishedEarly => "finished_early",
            Self::Cancelled => "cancelled",
            Self::Deferred => "deferred",
        }
    }

    /// Terminal entries are never selected again and are subject to retention
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "finished" => Ok(Self::Finished),
            "finished_early" => Ok(Self::FinishedEarly),
            "cancelled" => Ok(Self::Cancelled),
            "deferred" => Ok(Self::Deferred),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// A (workflow, event) execution request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub workflow_id: WorkflowId,
    pub event_id: EventId,
    pub status: QueueStatus,
    pub tries: u32,
    pub last_step_attempted: Option<StepId>,

    /// Earliest instant the entry may run; set on debounce clones
    pub execution_time: Option<DateTime<Utc>>,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl QueueEntry {
    /// Whether the entry may be processed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.execution_time.map_or(true, |t| t <= now)
    }
}

/// Queue entry to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueEntry {
    pub workflow_id: WorkflowId,
    pub event_id: EventId,
    pub status: QueueStatus,
    pub tries: u32,
    pub execution_time: Option<DateTime<Utc>>,
    pub time_created: DateTime<Utc>,
}

impl NewQueueEntry {
    /// A fresh ready entry
    pub fn ready(workflow_id: WorkflowId, event_id: EventId, now: DateTime<Utc>) -> Self {
        Self {
            workflow_id,
            event_id,
            status: QueueStatus::Ready,
            tries: 0,
            execution_time: None,
            time_created: now,
        }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    pub fn with_execution_time(mut self, at: DateTime<Utc>) -> Self {
        self.execution_time = Some(at);
        self
    }
}
