//! Step chain execution
//!
//! Runs steps strictly in order, one store transaction per step. A step's
//! writes and its step-result record are committed together, or not at all.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::model::{
    Event, NewStepResult, QueueEntry, QueueStatus, ResultMap, RunId, RunOutcome, StepDefinition,
    StepId, StepMarker, StepResultId, Workflow,
};
use crate::persistence::AutomationStore;
use crate::step::{ExecutionMode, Step, StepContext, StepError, StepOutcome};

/// How a chain walk ended
#[derive(Debug)]
pub(crate) enum ChainOutcome {
    Completed,
    Halted(StepMarker),
    Deferred(StepMarker),
    Superseded(StepMarker),
    Errored(StepMarker, StepError),
}

impl ChainOutcome {
    pub(crate) fn run_outcome(&self) -> RunOutcome {
        match self {
            Self::Completed => RunOutcome::Succeeded,
            Self::Halted(step) => RunOutcome::Failed { step: *step },
            Self::Deferred(step) => RunOutcome::Deferred { step: *step },
            Self::Superseded(step) => RunOutcome::Cancelled { step: *step },
            Self::Errored(step, _) => RunOutcome::Errored { step: *step },
        }
    }

    pub(crate) fn queue_status(&self) -> QueueStatus {
        match self {
            Self::Completed => QueueStatus::Finished,
            Self::Halted(_) => QueueStatus::FinishedEarly,
            Self::Deferred(_) => QueueStatus::Deferred,
            Self::Superseded(_) => QueueStatus::Cancelled,
            Self::Errored(..) => QueueStatus::Ready,
        }
    }

    /// Map a single step's outcome at `marker`
    pub(crate) fn from_step(outcome: &StepOutcome, marker: StepMarker) -> Self {
        match outcome {
            StepOutcome::Continue(_) => Self::Completed,
            StepOutcome::Halt(_) => Self::Halted(marker),
            StepOutcome::Defer(_) => Self::Deferred(marker),
            StepOutcome::Superseded(_) => Self::Superseded(marker),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ChainReport {
    pub outcome: ChainOutcome,
    pub results: ResultMap,

    /// Step-result records written, in order
    pub records: Vec<StepResultId>,
    pub last_step: Option<StepId>,
}

/// A committed step execution
pub(crate) struct ExecutedStep {
    pub outcome: StepOutcome,
    pub record: Option<StepResultId>,
}

/// The result map every run starts from
pub(crate) fn seed_results(workflow: &Workflow, event: &Event) -> ResultMap {
    let mut results = ResultMap::new();
    results.insert("eventid".to_string(), json!(event.id));
    results.insert("workflowid".to_string(), json!(workflow.id));
    results
}

pub(crate) fn marker_for(workflow: &Workflow, step: &StepDefinition) -> StepMarker {
    StepMarker {
        step_id: step.id,
        position: workflow
            .step_index(step.id)
            .map_or(step.step_order as usize + 1, |i| i + 1),
    }
}

/// Everything a chain walk needs besides the steps themselves
pub(crate) struct ChainRun<'a> {
    pub store: &'a dyn AutomationStore,
    pub workflow: &'a Workflow,
    pub queue_entry: Option<&'a QueueEntry>,
    pub event: &'a Event,
    pub run_id: RunId,
    pub mode: ExecutionMode,
    pub now: DateTime<Utc>,
    pub max_tries: u32,
}

impl ChainRun<'_> {
    /// Execute one step inside its own transaction
    ///
    /// A recorded outcome appends a step result chained to `previous_id`.
    /// On error the transaction is rolled back and nothing is recorded.
    pub(crate) async fn execute_step(
        &self,
        definition: &StepDefinition,
        step: &dyn Step,
        results: ResultMap,
        previous_id: Option<StepResultId>,
        derived_from: Option<StepResultId>,
    ) -> Result<ExecutedStep, StepError> {
        let ctx = StepContext::new(
            self.store,
            self.workflow,
            definition,
            self.queue_entry,
            self.now,
            self.mode,
        )
        .with_max_tries(self.max_tries);
        let mut tx = self.store.begin().await?;

        let executed = step.execute(&ctx, tx.as_mut(), self.event, results).await;
        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(
                    workflow_id = self.workflow.id,
                    step_id = definition.id,
                    "rolling back transaction of failed step"
                );
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback failed");
                }
                return Err(error);
            }
        };

        let record = if outcome.is_recorded() {
            let id = tx
                .append_step_result(NewStepResult {
                    run_id: self.run_id,
                    step_id: definition.id,
                    previous_id,
                    derived_from,
                    step_snapshot: definition.clone(),
                    results: outcome.results().clone(),
                    executed_at: self.now,
                })
                .await?;
            Some(id)
        } else {
            None
        };
        tx.commit().await?;

        if self.workflow.debug {
            let snapshot = serde_json::Value::Object(outcome.results().clone());
            info!(
                workflow_id = self.workflow.id,
                run_id = self.run_id,
                step_id = definition.id,
                success = outcome.is_success(),
                results = %snapshot,
                "step results"
            );
        }

        Ok(ExecutedStep { outcome, record })
    }

    /// Walk `steps` in order until one does not continue
    pub(crate) async fn run_steps(
        &self,
        steps: &[(&StepDefinition, &dyn Step)],
        mut results: ResultMap,
        mut previous_id: Option<StepResultId>,
    ) -> ChainReport {
        let mut records = Vec::new();

        for (definition, step) in steps {
            let marker = marker_for(self.workflow, definition);
            let executed = match self
                .execute_step(definition, *step, results.clone(), previous_id, None)
                .await
            {
                Ok(executed) => executed,
                Err(error) => {
                    return ChainReport {
                        outcome: ChainOutcome::Errored(marker, error),
                        results,
                        records,
                        last_step: Some(definition.id),
                    };
                }
            };

            if let Some(id) = executed.record {
                records.push(id);
                previous_id = Some(id);
            }
            let outcome = ChainOutcome::from_step(&executed.outcome, marker);
            results = executed.outcome.into_results();
            if !matches!(outcome, ChainOutcome::Completed) {
                return ChainReport {
                    outcome,
                    results,
                    records,
                    last_step: Some(definition.id),
                };
            }
        }

        ChainReport {
            outcome: ChainOutcome::Completed,
            results,
            records,
            last_step: steps.last().map(|(definition, _)| definition.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewEvent, NewRun, NewStepDefinition, NewWorkflow, StepKind};
    use crate::persistence::{InMemoryStore, StoreTransaction};
    use crate::step::StepRegistry;
    use async_trait::async_trait;

    struct Explode;

    #[async_trait]
    impl Step for Explode {
        async fn execute(
            &self,
            ctx: &StepContext<'_>,
            tx: &mut dyn StoreTransaction,
            event: &Event,
            _results: ResultMap,
        ) -> Result<StepOutcome, StepError> {
            tx.insert_run(NewRun::in_progress(ctx.workflow.id, event.clone(), ctx.now))
                .await?;
            Err(StepError::new("boom"))
        }
    }

    async fn fixture(store: &InMemoryStore) -> (Workflow, Event, RunId) {
        let now = Utc::now();
        let workflow = store
            .create_workflow(
                NewWorkflow::new("wf", "course_viewed")
                    .with_step(NewStepDefinition::new(
                        StepKind::Lookup,
                        "event_fields",
                        json!({"fields": ["courseid"]}),
                    ))
                    .with_step(NewStepDefinition::new(
                        StepKind::Filter,
                        "fail",
                        json!({}),
                    )),
            )
            .await
            .unwrap();
        let event = store
            .insert_event(NewEvent::new("course_viewed", now).with_field("courseid", 7))
            .await
            .unwrap()
            .event;
        let run = store
            .create_run(NewRun::in_progress(workflow.id, event.clone(), now))
            .await
            .unwrap();
        (workflow, event, run.id)
    }

    #[tokio::test]
    async fn test_halt_stops_chain_and_records_prior_steps() {
        let store = InMemoryStore::new();
        let (workflow, event, run_id) = fixture(&store).await;
        let chain = StepRegistry::with_builtins()
            .resolve_chain(&workflow)
            .unwrap();
        let steps: Vec<(&StepDefinition, &dyn Step)> = workflow
            .steps
            .iter()
            .zip(chain.iter().map(|s| s.as_ref()))
            .collect();

        let runner = ChainRun {
            store: &store,
            workflow: &workflow,
            queue_entry: None,
            event: &event,
            run_id,
            mode: ExecutionMode::Queued,
            now: Utc::now(),
            max_tries: 5,
        };
        let report = runner
            .run_steps(&steps, seed_results(&workflow, &event), None)
            .await;

        assert!(matches!(report.outcome, ChainOutcome::Halted(m) if m.position == 2));
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.last_step, Some(workflow.steps[1].id));
        assert_eq!(report.results.get("courseid"), Some(&json!(7)));
        assert_eq!(report.outcome.queue_status(), QueueStatus::FinishedEarly);
    }

    #[tokio::test]
    async fn test_error_rolls_back_step_writes() {
        let store = InMemoryStore::new();
        let (workflow, event, run_id) = fixture(&store).await;
        let runner = ChainRun {
            store: &store,
            workflow: &workflow,
            queue_entry: None,
            event: &event,
            run_id,
            mode: ExecutionMode::Queued,
            now: Utc::now(),
            max_tries: 5,
        };

        let explode = Explode;
        let steps: Vec<(&StepDefinition, &dyn Step)> = vec![(&workflow.steps[0], &explode)];
        let report = runner
            .run_steps(&steps, seed_results(&workflow, &event), None)
            .await;

        assert!(matches!(report.outcome, ChainOutcome::Errored(..)));
        assert_eq!(report.outcome.queue_status(), QueueStatus::Ready);
        assert!(report.records.is_empty());
        // Only the run opened by the fixture exists
        assert_eq!(store.list_runs(workflow.id).await.unwrap().len(), 1);
        assert!(store.list_step_results(run_id).await.unwrap().is_empty());
    }

    #[test]
    fn test_seed_results() {
        let workflow = Workflow {
            id: 3,
            name: "wf".into(),
            description: String::new(),
            event_name: "e".into(),
            enabled: true,
            draft: false,
            realtime: false,
            debug: false,
            last_triggered: None,
            steps: vec![],
        };
        let event = NewEvent::new("e", Utc::now()).into_event(9);
        let seed = seed_results(&workflow, &event);
        assert_eq!(seed.get("eventid"), Some(&json!(9)));
        assert_eq!(seed.get("workflowid"), Some(&json!(3)));
    }
}
