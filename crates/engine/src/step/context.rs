//! Step execution context

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{QueueEntry, StepDefinition, StepMarker, Workflow};
use crate::persistence::AutomationStore;

/// How the chain is being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Inline with event submission
    Realtime,

    /// By the queue processor
    Queued,

    /// By an administrator replaying history
    Replay,
}

/// Principal a step acts on behalf of
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActingAs {
    System,
    User { user_id: i64 },
}

impl fmt::Display for ActingAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User { user_id } => write!(f, "user:{user_id}"),
        }
    }
}

/// Context provided to steps during execution
///
/// The context is immutable. Running part of a step as another principal
/// goes through [`StepContext::impersonate`], which hands out a derived
/// context and leaves this one untouched.
#[derive(Clone)]
pub struct StepContext<'a> {
    store: &'a dyn AutomationStore,

    /// Workflow being executed
    pub workflow: &'a Workflow,

    /// Definition of the executing step
    pub step: &'a StepDefinition,

    /// Queue entry driving this execution, absent in realtime and replay
    pub queue_entry: Option<&'a QueueEntry>,

    /// Logical time of the execution
    pub now: DateTime<Utc>,
    pub mode: ExecutionMode,

    /// Attempt limit of the queue; ready entries at it are never selected again
    pub max_tries: u32,

    acting_as: ActingAs,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        store: &'a dyn AutomationStore,
        workflow: &'a Workflow,
        step: &'a StepDefinition,
        queue_entry: Option<&'a QueueEntry>,
        now: DateTime<Utc>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            store,
            workflow,
            step,
            queue_entry,
            now,
            mode,
            max_tries: u32::MAX,
            acting_as: ActingAs::System,
        }
    }

    pub(crate) fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// Read access to the store; writes go through the step's transaction
    pub fn store(&self) -> &'a dyn AutomationStore {
        self.store
    }

    pub fn acting_as(&self) -> ActingAs {
        self.acting_as
    }

    /// The executing step with its 1-based position in the chain
    pub fn marker(&self) -> StepMarker {
        let position = self
            .workflow
            .step_index(self.step.id)
            .map_or(self.step.step_order as usize + 1, |i| i + 1);
        StepMarker {
            step_id: self.step.id,
            position,
        }
    }

    /// Act as `principal` for the lifetime of the returned guard
    pub fn impersonate(&self, principal: ActingAs) -> Impersonation<'_, 'a> {
        debug!(
            step_id = self.step.id,
            from = %self.acting_as,
            to = %principal,
            "impersonation started"
        );
        let mut ctx = self.clone();
        ctx.acting_as = principal;
        Impersonation {
            ctx,
            restored: self.acting_as,
            _parent: PhantomData,
        }
    }
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("workflow_id", &self.workflow.id)
            .field("step_id", &self.step.id)
            .field("queue_entry", &self.queue_entry.map(|q| q.id))
            .field("now", &self.now)
            .field("mode", &self.mode)
            .field("acting_as", &self.acting_as)
            .finish()
    }
}

/// Scoped impersonation; dereferences to the derived context
///
/// Borrowing the parent context keeps the guard from outliving it.
pub struct Impersonation<'p, 'a> {
    ctx: StepContext<'a>,
    restored: ActingAs,
    _parent: PhantomData<&'p StepContext<'a>>,
}

impl<'a> Deref for Impersonation<'_, 'a> {
    type Target = StepContext<'a>;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl Drop for Impersonation<'_, '_> {
    fn drop(&mut self) {
        debug!(
            step_id = self.ctx.step.id,
            restored = %self.restored,
            "impersonation ended"
        );
    }
}
