//! Debounce coalescer
//!
//! Collapses a burst of equivalent events into one execution of the rest of
//! the chain. Each queue entry passes the debounce step twice:
//!
//! 1. **First pass** (entry has no execution time): a clone of the entry is
//!    queued with `execution_time = now + duration` and the step returns
//!    [`StepOutcome::Defer`]. The original entry goes dormant as `deferred`.
//! 2. **Decision pass** (the clone is due): every ready entry of the same
//!    workflow whose event matches on the configured fields is a candidate,
//!    unless it has used up its attempts.
//!    One winner is chosen, the other candidates are cancelled, and only the
//!    winner continues down the chain.
//!
//! Winner selection, in priority order:
//! - entries without an execution time yet win over scheduled ones; among
//!   them the most recently created wins, ties going to the lowest event id
//! - otherwise the latest execution time wins, ties going to the most
//!   recently created entry
//!
//! Winner selection is only consistent when entries of one workflow are
//! processed one at a time in creation order.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    is_valid_identifier, ExecutionMode, Step, StepConfigError, StepContext, StepDescriptor,
    StepError, StepOutcome, StepType,
};
use crate::model::{
    Event, NewQueueEntry, NewRun, QueueEntry, QueueStatus, ResultMap, RunOutcome, StepKind,
};
use crate::persistence::StoreTransaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Event fields that must be equal for two events to coalesce
    #[serde(default)]
    pub fields: Vec<String>,

    /// Window length in seconds
    pub duration: u64,
}

#[derive(Debug, Clone)]
pub struct DebounceStep {
    config: DebounceConfig,
}

impl DebounceStep {
    /// Whether `other` matches `event` on every configured field `event` has
    fn matches(&self, event: &Event, other: &Event) -> bool {
        self.config
            .fields
            .iter()
            .filter_map(|field| event.field(field).map(|value| (field, value)))
            .all(|(field, value)| other.field(field).as_ref() == Some(&value))
    }

    async fn defer(
        &self,
        ctx: &StepContext<'_>,
        tx: &mut dyn StoreTransaction,
        entry: &QueueEntry,
        mut results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        if !results.contains_key("eventid") {
            return Err(StepError::new("debounce needs eventid in the workflow data")
                .with_type("missing_field"));
        }

        let execute_at = i64::try_from(self.config.duration)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|window| ctx.now.checked_add_signed(window))
            .ok_or_else(|| {
                StepError::new("debounce duration out of range").with_type("invalid_config")
            })?;
        let clone_id = tx
            .insert_queue_entry(
                NewQueueEntry::ready(entry.workflow_id, entry.event_id, ctx.now)
                    .with_execution_time(execute_at),
            )
            .await?;

        debug!(
            workflow_id = entry.workflow_id,
            entry_id = entry.id,
            clone_id,
            %execute_at,
            "debounce deferred"
        );
        results.insert("debounce_entry".to_string(), json!(clone_id));
        results.insert("debounce_until".to_string(), json!(execute_at.timestamp()));
        Ok(StepOutcome::Defer(results))
    }

    async fn decide(
        &self,
        ctx: &StepContext<'_>,
        tx: &mut dyn StoreTransaction,
        entry: &QueueEntry,
        event: &Event,
        mut results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        let mut candidates: Vec<(QueueEntry, Event)> = ctx
            .store()
            .list_ready_entries_with_events(entry.workflow_id, ctx.max_tries)
            .await?
            .into_iter()
            .filter(|(q, e)| q.id == entry.id || self.matches(event, e))
            .collect();
        if !candidates.iter().any(|(q, _)| q.id == entry.id) {
            candidates.push((entry.clone(), event.clone()));
        }

        let entries: Vec<&QueueEntry> = candidates.iter().map(|(q, _)| q).collect();
        let winner = select_winner(&entries).map_or(entry.id, |w| w.id);
        let winner_event = candidates
            .iter()
            .find(|(q, _)| q.id == winner)
            .map_or(event.id, |(q, _)| q.event_id);

        let mut cancelled = Vec::new();
        for (candidate, candidate_event) in &candidates {
            if candidate.id == winner || candidate.id == entry.id {
                continue;
            }
            tx.set_queue_status(candidate.id, QueueStatus::Cancelled, ctx.now)
                .await?;
            tx.insert_run(
                NewRun::in_progress(candidate.workflow_id, candidate_event.clone(), ctx.now)
                    .with_outcome(RunOutcome::Cancelled {
                        step: ctx.marker(),
                    }),
            )
            .await?;
            cancelled.push(candidate.event_id);
        }

        info!(
            workflow_id = entry.workflow_id,
            entry_id = entry.id,
            winner,
            cancelled = cancelled.len(),
            "debounce decided"
        );

        results.insert("debounce_winner".to_string(), json!(winner_event));
        if winner == entry.id {
            results.insert("debounced_ids".to_string(), json!(cancelled));
            Ok(StepOutcome::Continue(results))
        } else {
            Ok(StepOutcome::Superseded(results))
        }
    }
}

/// Pick the entry that carries the coalesced execution
pub(crate) fn select_winner<'e>(candidates: &[&'e QueueEntry]) -> Option<&'e QueueEntry> {
    let unscheduled = candidates
        .iter()
        .copied()
        .filter(|q| q.execution_time.is_none())
        .max_by(|a, b| {
            a.time_created
                .cmp(&b.time_created)
                .then(b.event_id.cmp(&a.event_id))
                .then(b.id.cmp(&a.id))
        });
    if unscheduled.is_some() {
        return unscheduled;
    }

    candidates.iter().copied().max_by(|a, b| {
        a.execution_time
            .cmp(&b.execution_time)
            .then(a.time_created.cmp(&b.time_created))
            .then(a.id.cmp(&b.id))
    })
}

impl StepType for DebounceStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "debounce",
        kind: StepKind::Debounce,
        name: "Debounce",
        description: "Runs the rest of the workflow once per burst of matching events",
        output_fields: &[
            "debounce_entry",
            "debounce_until",
            "debounce_winner",
            "debounced_ids",
        ],
    };

    fn from_config(config: &Value) -> Result<Self, StepConfigError> {
        let config: DebounceConfig = serde_json::from_value(config.clone())?;
        if let Some(bad) = config.fields.iter().find(|f| !is_valid_identifier(f)) {
            return Err(StepConfigError(format!("invalid match field: {bad:?}")));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Step for DebounceStep {
    async fn execute(
        &self,
        ctx: &StepContext<'_>,
        tx: &mut dyn StoreTransaction,
        event: &Event,
        results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        match ctx.mode {
            ExecutionMode::Realtime => {
                return Err(StepError::new("debounce only runs from the queue")
                    .with_type("realtime_unsupported"));
            }
            // Coalescing belongs to the queue; a replay goes straight through
            ExecutionMode::Replay => return Ok(StepOutcome::Continue(results)),
            ExecutionMode::Queued => {}
        }

        let entry = ctx
            .queue_entry
            .ok_or_else(|| StepError::new("debounce needs a queue entry"))?;
        match entry.execution_time {
            None => self.defer(ctx, tx, entry, results).await,
            Some(_) => self.decide(ctx, tx, entry, event, results).await,
        }
    }
}
