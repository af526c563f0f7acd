//! Event intake
//!
//! Events nobody subscribes to are dropped without a write. Subscribed events
//! are stored, then every active realtime workflow for the event name runs
//! its chain inline. A realtime chain that errors is handed to the queue with
//! one attempt already counted; one that halts is simply done.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{Event, EventId, NewEvent, NewQueueEntry, NewRun, StepDefinition, Workflow};
use crate::persistence::{AutomationStore, StoreError};
use crate::step::{ExecutionMode, Step};

use super::executor::{AutomationEngine, EngineError};
use super::pipeline::{seed_results, ChainOutcome, ChainRun};

/// Event names with at least one active workflow, built lazily
#[derive(Debug, Default)]
pub(crate) struct SubscriptionCache {
    names: RwLock<Option<Arc<HashSet<String>>>>,
}

impl SubscriptionCache {
    pub(crate) async fn is_subscribed(
        &self,
        store: &dyn AutomationStore,
        event_name: &str,
    ) -> Result<bool, StoreError> {
        let cached = self.names.read().clone();
        let names = match cached {
            Some(names) => names,
            None => {
                let names: HashSet<String> = store
                    .list_workflows()
                    .await?
                    .into_iter()
                    .filter(Workflow::is_active)
                    .map(|w| w.event_name)
                    .collect();
                debug!(event_names = names.len(), "rebuilt subscription cache");
                let names = Arc::new(names);
                *self.names.write() = Some(Arc::clone(&names));
                names
            }
        };
        Ok(names.contains(event_name))
    }

    pub(crate) fn invalidate(&self) {
        *self.names.write() = None;
    }
}

/// What happened to a submitted event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmitReport {
    /// Stored event, `None` when no workflow subscribes to the name
    pub event_id: Option<EventId>,

    /// The idempotency key matched an event stored earlier; nothing ran
    pub duplicate: bool,

    /// Realtime chains that ran every step
    pub realtime_finished: usize,

    /// Realtime chains stopped by a step
    pub realtime_halted: usize,

    /// Realtime chains that errored and were queued for retry
    pub realtime_queued: usize,

    /// Realtime workflows that could not be run at all
    pub realtime_failed: usize,
}

enum RealtimeResult {
    Finished,
    Halted,
    Queued,
}

impl<S: AutomationStore> AutomationEngine<S> {
    /// Submit an event
    ///
    /// Failures of one realtime workflow are logged and counted; the other
    /// workflows subscribed to the event still run.
    #[instrument(skip(self, event), fields(event_name = %event.name))]
    pub async fn submit(
        &self,
        event: NewEvent,
        now: DateTime<Utc>,
    ) -> Result<SubmitReport, EngineError> {
        let store: &dyn AutomationStore = self.store.as_ref();
        if !self.subscriptions.is_subscribed(store, &event.name).await? {
            debug!("no active workflow subscribes to event");
            return Ok(SubmitReport::default());
        }

        let inserted = self.store.insert_event(event).await?;
        let event = inserted.event;
        let mut report = SubmitReport {
            event_id: Some(event.id),
            duplicate: !inserted.created,
            ..Default::default()
        };
        if report.duplicate {
            debug!(event_id = event.id, "event already submitted");
            return Ok(report);
        }

        let workflows = self.store.list_workflows().await?;
        for workflow in workflows
            .iter()
            .filter(|w| w.realtime && w.subscribes_to(&event.name))
        {
            match self.run_realtime(workflow, &event, now).await {
                Ok(RealtimeResult::Finished) => report.realtime_finished += 1,
                Ok(RealtimeResult::Halted) => report.realtime_halted += 1,
                Ok(RealtimeResult::Queued) => report.realtime_queued += 1,
                Err(e) => {
                    error!(
                        workflow_id = workflow.id,
                        event_id = event.id,
                        error = %e,
                        "realtime workflow failed"
                    );
                    report.realtime_failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn run_realtime(
        &self,
        workflow: &Workflow,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<RealtimeResult, EngineError> {
        self.store.touch_workflow(workflow.id, now).await?;
        let chain = self.registry.resolve_chain(workflow)?;
        let steps: Vec<(&StepDefinition, &dyn Step)> = workflow
            .steps
            .iter()
            .zip(chain.iter().map(|s| s.as_ref()))
            .collect();

        let run = self
            .store
            .create_run(NewRun::in_progress(workflow.id, event.clone(), now))
            .await?;
        let runner = ChainRun {
            store: self.store.as_ref(),
            workflow,
            queue_entry: None,
            event,
            run_id: run.id,
            mode: ExecutionMode::Realtime,
            now,
            max_tries: self.config.max_tries,
        };
        let report = runner
            .run_steps(&steps, seed_results(workflow, event), None)
            .await;
        self.store
            .update_run_outcome(run.id, report.outcome.run_outcome())
            .await?;

        match report.outcome {
            ChainOutcome::Completed => {
                info!(workflow_id = workflow.id, run_id = run.id, "realtime run finished");
                Ok(RealtimeResult::Finished)
            }
            ChainOutcome::Errored(marker, error) => {
                warn!(
                    workflow_id = workflow.id,
                    event_id = event.id,
                    step_id = marker.step_id,
                    error = %error,
                    "realtime step failed; queueing for retry"
                );
                self.store
                    .insert_queue_entry(NewQueueEntry::ready(workflow.id, event.id, now).with_tries(1))
                    .await?;
                Ok(RealtimeResult::Queued)
            }
            ChainOutcome::Halted(_) | ChainOutcome::Deferred(_) | ChainOutcome::Superseded(_) => {
                Ok(RealtimeResult::Halted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewStepDefinition, NewWorkflow, QueueStatus, RunOutcome, StepKind};
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    fn log_step() -> NewStepDefinition {
        NewStepDefinition::new(StepKind::Action, "log_dump", json!({"template": "seen {courseid}"}))
    }

    #[tokio::test]
    async fn test_unsubscribed_event_is_not_stored() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        engine
            .create_workflow(NewWorkflow::new("wf", "course_viewed").with_step(log_step()))
            .await
            .unwrap();

        let report = engine
            .submit(NewEvent::new("user_created", Utc::now()), Utc::now())
            .await
            .unwrap();
        assert_eq!(report, SubmitReport::default());
        assert_eq!(store.event_count(), 0);

        let report = engine
            .submit(NewEvent::new("course_viewed", Utc::now()), Utc::now())
            .await
            .unwrap();
        assert!(report.event_id.is_some());
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_cache_follows_invalidation() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        assert!(!engine
            .subscriptions
            .is_subscribed(&store, "course_viewed")
            .await
            .unwrap());

        // Written behind the engine's back: the cache is stale until invalidated
        store
            .create_workflow(NewWorkflow::new("wf", "course_viewed"))
            .await
            .unwrap();
        assert!(!engine
            .subscriptions
            .is_subscribed(&store, "course_viewed")
            .await
            .unwrap());

        engine.invalidate_subscriptions();
        assert!(engine
            .subscriptions
            .is_subscribed(&store, "course_viewed")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_realtime_runs_inline_and_touches_workflow() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        let workflow = engine
            .create_workflow(
                NewWorkflow::new("wf", "course_viewed")
                    .realtime()
                    .with_step(log_step()),
            )
            .await
            .unwrap();
        let now = Utc::now();

        let report = engine
            .submit(
                NewEvent::new("course_viewed", now).with_field("courseid", 4),
                now,
            )
            .await
            .unwrap();
        assert_eq!(report.realtime_finished, 1);

        let workflow = store.get_workflow(workflow.id).await.unwrap();
        assert_eq!(workflow.last_triggered, Some(now));
        let runs = store.list_runs(workflow.id).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
        assert!(store.list_queue_entries(workflow.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_realtime_debounce_falls_back_to_queue() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        let workflow = engine
            .create_workflow(
                NewWorkflow::new("wf", "course_viewed")
                    .realtime()
                    .with_step(NewStepDefinition::new(
                        StepKind::Debounce,
                        "debounce",
                        json!({"fields": ["courseid"], "duration": 30}),
                    ))
                    .with_step(log_step()),
            )
            .await
            .unwrap();

        let report = engine
            .submit(NewEvent::new("course_viewed", Utc::now()), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.realtime_queued, 1);

        let entries = store.list_queue_entries(workflow.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, QueueStatus::Ready);
        assert_eq!(entries[0].tries, 1);
        assert!(store.list_runs(workflow.id).await.unwrap()[0]
            .outcome
            .is_error());
    }

    #[tokio::test]
    async fn test_duplicate_submission_runs_once() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        let workflow = engine
            .create_workflow(
                NewWorkflow::new("wf", "course_viewed")
                    .realtime()
                    .with_step(log_step()),
            )
            .await
            .unwrap();

        let event = NewEvent::new("course_viewed", Utc::now()).with_idempotency_key("view-1");
        let first = engine.submit(event.clone(), Utc::now()).await.unwrap();
        let second = engine.submit(event, Utc::now()).await.unwrap();

        assert_eq!(first.event_id, second.event_id);
        assert!(second.duplicate);
        assert_eq!(second.realtime_finished, 0);
        assert_eq!(store.list_runs(workflow.id).await.unwrap().len(), 1);
    }
}
