//! Queue processor
//!
//! Entries are processed one at a time, oldest first. The wall-clock budget
//! is checked between entries, never inside one; an entry that is being
//! processed always runs to the end of its chain.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{NewRun, QueueEntry, QueueStatus, StepDefinition};
use crate::persistence::AutomationStore;
use crate::step::{ExecutionMode, Step};

use super::executor::{AutomationEngine, EngineError};
use super::pipeline::{seed_results, ChainOutcome, ChainRun};

/// Counters of one processing pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Entries selected for this pass
    pub selected: usize,
    pub finished: usize,
    pub finished_early: usize,
    pub deferred: usize,
    pub cancelled: usize,

    /// Entries whose chain errored; they stay ready for another attempt
    pub retried: usize,

    /// Entries cancelled by an earlier entry of the same pass
    pub skipped: usize,

    /// Entries that could not be processed because the store failed
    pub failed: usize,

    /// The pass stopped before every selected entry was processed
    pub budget_exhausted: bool,
}

impl ProcessReport {
    pub fn processed(&self) -> usize {
        self.finished + self.finished_early + self.deferred + self.cancelled + self.retried
    }

    fn record(&mut self, status: QueueStatus) {
        match status {
            QueueStatus::Finished => self.finished += 1,
            QueueStatus::FinishedEarly => self.finished_early += 1,
            QueueStatus::Deferred => self.deferred += 1,
            QueueStatus::Cancelled => self.cancelled += 1,
            QueueStatus::Ready => self.retried += 1,
        }
    }
}

enum EntryResult {
    Processed(QueueStatus),
    Skipped,
}

impl<S: AutomationStore> AutomationEngine<S> {
    /// Process due queue entries with the configured limits
    pub async fn process_due(&self, now: DateTime<Utc>) -> Result<ProcessReport, EngineError> {
        self.process_queue(now, self.config.max_items, self.config.max_duration)
            .await
    }

    /// Process up to `max_items` due entries, stopping early once
    /// `max_duration` has elapsed
    ///
    /// An entry's failure never aborts the pass: it is logged and the pass
    /// moves on. Only the initial selection can fail the call.
    #[instrument(skip(self))]
    pub async fn process_queue(
        &self,
        now: DateTime<Utc>,
        max_items: usize,
        max_duration: Duration,
    ) -> Result<ProcessReport, EngineError> {
        let started = Instant::now();
        let entries = self
            .store
            .select_due_entries(now, self.config.max_tries, max_items)
            .await?;
        let mut report = ProcessReport {
            selected: entries.len(),
            ..Default::default()
        };

        for (index, entry) in entries.iter().enumerate() {
            if index > 0 && started.elapsed() >= max_duration {
                info!(
                    processed = index,
                    remaining = entries.len() - index,
                    "processing budget exhausted"
                );
                report.budget_exhausted = true;
                break;
            }

            match self.process_entry(entry, now).await {
                Ok(EntryResult::Processed(status)) => report.record(status),
                Ok(EntryResult::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(
                        entry_id = entry.id,
                        workflow_id = entry.workflow_id,
                        error = %e,
                        "failed to process queue entry"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.selected > 0 {
            info!(
                selected = report.selected,
                finished = report.finished,
                finished_early = report.finished_early,
                deferred = report.deferred,
                cancelled = report.cancelled,
                retried = report.retried,
                "processed queue"
            );
        }
        Ok(report)
    }

    async fn process_entry(
        &self,
        selected: &QueueEntry,
        now: DateTime<Utc>,
    ) -> Result<EntryResult, EngineError> {
        // A debounce decision earlier in this pass may have cancelled it
        let current = self.store.get_queue_entry(selected.id).await?;
        if current.status != QueueStatus::Ready {
            debug!(entry_id = current.id, status = %current.status, "entry no longer ready");
            return Ok(EntryResult::Skipped);
        }

        let entry = self.store.begin_attempt(current.id, now).await?;
        let workflow = self.store.get_workflow(entry.workflow_id).await?;

        let Some(event) = self.store.get_event(entry.event_id).await? else {
            error!(
                entry_id = entry.id,
                event_id = entry.event_id,
                "event snapshot missing; closing entry"
            );
            self.store
                .finish_attempt(entry.id, QueueStatus::FinishedEarly, None, now)
                .await?;
            return Ok(EntryResult::Processed(QueueStatus::FinishedEarly));
        };

        let chain = match self.registry.resolve_chain(&workflow) {
            Ok(chain) => chain,
            Err(e) => {
                error!(
                    entry_id = entry.id,
                    workflow_id = workflow.id,
                    error = %e,
                    "workflow cannot be resolved; closing entry"
                );
                self.store
                    .finish_attempt(entry.id, QueueStatus::FinishedEarly, None, now)
                    .await?;
                return Ok(EntryResult::Processed(QueueStatus::FinishedEarly));
            }
        };
        let steps: Vec<(&StepDefinition, &dyn Step)> = workflow
            .steps
            .iter()
            .zip(chain.iter().map(|s| s.as_ref()))
            .collect();

        self.store.touch_workflow(workflow.id, now).await?;
        let run = self
            .store
            .create_run(NewRun::in_progress(workflow.id, event.clone(), now))
            .await?;
        let runner = ChainRun {
            store: self.store.as_ref(),
            workflow: &workflow,
            queue_entry: Some(&entry),
            event: &event,
            run_id: run.id,
            mode: ExecutionMode::Queued,
            now,
            max_tries: self.config.max_tries,
        };
        let report = runner
            .run_steps(&steps, seed_results(&workflow, &event), None)
            .await;

        if let ChainOutcome::Errored(marker, step_error) = &report.outcome {
            error!(
                entry_id = entry.id,
                workflow_id = workflow.id,
                event_id = event.id,
                step_id = marker.step_id,
                position = marker.position,
                tries = entry.tries,
                error_type = step_error.error_type.as_deref().unwrap_or("step"),
                details = ?step_error.details,
                "step failed: {}",
                step_error.message
            );
            if entry.tries >= self.config.max_tries {
                warn!(entry_id = entry.id, tries = entry.tries, "entry reached max tries");
            }
        }

        let status = report.outcome.queue_status();
        self.store
            .update_run_outcome(run.id, report.outcome.run_outcome())
            .await?;
        self.store
            .finish_attempt(entry.id, status, report.last_step, now)
            .await?;
        debug!(entry_id = entry.id, run_id = run.id, %status, "entry processed");
        Ok(EntryResult::Processed(status))
    }
}
