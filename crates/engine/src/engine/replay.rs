//! History replay
//!
//! Administrators re-execute recorded work from the run history:
//! - a single step, as a sibling of the original record
//! - a step and then one or all of the steps after it
//! - a whole run, as a new run against the stored event snapshot
//! - the latest run of every event whose last attempt errored
//!
//! Replays run in [`ExecutionMode::Replay`]. A step's configuration comes
//! either from the current definition or from the snapshot taken when the
//! original record was written, see [`ConfigSource`].

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::model::{
    EventId, NewRun, ResultMap, RunId, RunOutcome, RunRecord, StepDefinition, StepId,
    StepResultId, StepResultRecord, Workflow, WorkflowId,
};
use crate::persistence::AutomationStore;
use crate::step::{ExecutionMode, Step};

use super::executor::{AutomationEngine, EngineError};
use super::pipeline::{marker_for, seed_results, ChainOutcome, ChainRun};

/// Which configuration a replayed step runs with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// The step definition as currently stored
    #[default]
    Current,

    /// The definition recorded with the original execution
    Historic,
}

/// Result of a replay
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub run_id: RunId,

    /// Step-result records written by the replay, in order
    pub records: Vec<StepResultId>,

    /// Result map after the last replayed step
    pub results: ResultMap,
    pub outcome: RunOutcome,
}

/// A recorded step, loaded with everything needed to run it again
struct ReplayTarget {
    record: StepResultRecord,
    run: RunRecord,
    workflow: Workflow,
    definition: StepDefinition,
    input: ResultMap,
}

impl<S: AutomationStore> AutomationEngine<S> {
    /// Re-run a recorded step with its current configuration
    pub async fn rerun_step(&self, result_id: StepResultId) -> Result<ReplayReport, EngineError> {
        self.rerun_step_with(result_id, ConfigSource::Current).await
    }

    /// Re-run a recorded step with the configuration it originally ran with
    pub async fn rerun_step_historic(
        &self,
        result_id: StepResultId,
    ) -> Result<ReplayReport, EngineError> {
        self.rerun_step_with(result_id, ConfigSource::Historic)
            .await
    }

    /// Re-run a recorded step
    ///
    /// The step receives the result map its original predecessor produced.
    /// A recorded outcome is written as a sibling of the original: same
    /// predecessor, `derived_from` pointing at the original. The run's
    /// outcome is left alone.
    #[instrument(skip(self))]
    pub async fn rerun_step_with(
        &self,
        result_id: StepResultId,
        source: ConfigSource,
    ) -> Result<ReplayReport, EngineError> {
        let target = self.load_replay_target(result_id, source).await?;
        let step = self.registry.resolve(&target.definition)?;
        let runner = self.replay_runner(&target.workflow, &target.run);

        let marker = marker_for(&target.workflow, &target.definition);
        let report = match runner
            .execute_step(
                &target.definition,
                step.as_ref(),
                target.input.clone(),
                target.record.previous_id,
                Some(target.record.id),
            )
            .await
        {
            Ok(executed) => ReplayReport {
                run_id: target.run.id,
                records: executed.record.into_iter().collect(),
                outcome: ChainOutcome::from_step(&executed.outcome, marker).run_outcome(),
                results: executed.outcome.into_results(),
            },
            Err(e) => {
                error!(result_id, step_id = marker.step_id, error = %e, "replayed step failed");
                ReplayReport {
                    run_id: target.run.id,
                    records: vec![],
                    results: target.input,
                    outcome: RunOutcome::Errored { step: marker },
                }
            }
        };

        info!(
            result_id,
            run_id = report.run_id,
            outcome = %report.outcome.badge(),
            "replayed step"
        );
        Ok(report)
    }

    /// Re-run a recorded step, then the next step (`finish_all == false`) or
    /// every remaining step of the workflow
    ///
    /// With [`ConfigSource::Historic`] the later steps use the snapshot
    /// recorded in the same run when there is one. The run's outcome is
    /// updated; it stays in progress when steps remain unexecuted.
    #[instrument(skip(self))]
    pub async fn rerun_step_and_continue(
        &self,
        result_id: StepResultId,
        finish_all: bool,
        source: ConfigSource,
    ) -> Result<ReplayReport, EngineError> {
        let target = self.load_replay_target(result_id, source).await?;
        let index = target
            .workflow
            .step_index(target.record.step_id)
            .ok_or_else(|| {
                EngineError::InvalidReplay(format!(
                    "step {} is no longer part of workflow {}",
                    target.record.step_id, target.workflow.id
                ))
            })?;

        let later = &target.workflow.steps[index + 1..];
        let take = if finish_all { later.len() } else { later.len().min(1) };
        let snapshots = match source {
            ConfigSource::Current => BTreeMap::new(),
            ConfigSource::Historic => self.run_snapshots(target.run.id).await?,
        };
        let mut definitions = vec![target.definition.clone()];
        definitions.extend(later[..take].iter().map(|current| {
            snapshots
                .get(&current.id)
                .cloned()
                .unwrap_or_else(|| current.clone())
        }));

        // Resolve everything first so an unusable later step fails the replay up front
        let chain = definitions
            .iter()
            .map(|d| self.registry.resolve(d))
            .collect::<Result<Vec<Box<dyn Step>>, _>>()?;
        let runner = self.replay_runner(&target.workflow, &target.run);

        let first = runner
            .execute_step(
                &definitions[0],
                chain[0].as_ref(),
                target.input.clone(),
                target.record.previous_id,
                Some(target.record.id),
            )
            .await;
        let marker = marker_for(&target.workflow, &definitions[0]);

        let (outcome, results, records) = match first {
            Err(e) => {
                error!(result_id, step_id = marker.step_id, error = %e, "replayed step failed");
                (RunOutcome::Errored { step: marker }, target.input, vec![])
            }
            Ok(executed) if !executed.outcome.is_success() => (
                ChainOutcome::from_step(&executed.outcome, marker).run_outcome(),
                executed.outcome.into_results(),
                executed.record.into_iter().collect(),
            ),
            Ok(executed) => {
                let steps: Vec<(&StepDefinition, &dyn Step)> = definitions[1..]
                    .iter()
                    .zip(chain[1..].iter().map(|s| s.as_ref()))
                    .collect();
                let chain_report = runner
                    .run_steps(&steps, executed.outcome.into_results(), executed.record)
                    .await;

                let mut records: Vec<StepResultId> = executed.record.into_iter().collect();
                records.extend(chain_report.records);
                let reached_end = index + 1 + take == target.workflow.steps.len();
                let outcome = match chain_report.outcome {
                    ChainOutcome::Completed if !reached_end => RunOutcome::InProgress,
                    other => other.run_outcome(),
                };
                (outcome, chain_report.results, records)
            }
        };

        self.store
            .update_run_outcome(target.run.id, outcome)
            .await?;
        info!(
            result_id,
            run_id = target.run.id,
            steps = definitions.len(),
            outcome = %outcome.badge(),
            "replayed steps"
        );
        Ok(ReplayReport {
            run_id: target.run.id,
            records,
            results,
            outcome,
        })
    }

    /// Run a workflow again from scratch against the event snapshot of `run_id`
    ///
    /// Creates a new run with the next number for the (workflow, event) pair.
    #[instrument(skip(self))]
    pub async fn rerun_workflow_from_event(
        &self,
        run_id: RunId,
    ) -> Result<ReplayReport, EngineError> {
        let original = self.store.get_run(run_id).await?;
        let workflow = self.store.get_workflow(original.workflow_id).await?;
        let chain = self.registry.resolve_chain(&workflow)?;
        let steps: Vec<(&StepDefinition, &dyn Step)> = workflow
            .steps
            .iter()
            .zip(chain.iter().map(|s| s.as_ref()))
            .collect();

        let now = Utc::now();
        self.store.touch_workflow(workflow.id, now).await?;
        let run = self
            .store
            .create_run(NewRun::in_progress(
                workflow.id,
                original.event.clone(),
                now,
            ))
            .await?;
        let runner = self.replay_runner(&workflow, &run);
        let report = runner
            .run_steps(&steps, seed_results(&workflow, &run.event), None)
            .await;

        let outcome = report.outcome.run_outcome();
        self.store.update_run_outcome(run.id, outcome).await?;
        info!(
            original_run = run_id,
            run_id = run.id,
            number = run.number,
            outcome = %outcome.badge(),
            "reran workflow"
        );
        Ok(ReplayReport {
            run_id: run.id,
            records: report.records,
            results: report.results,
            outcome,
        })
    }

    /// Rerun every event of a workflow whose latest run errored
    ///
    /// Runs are grouped by event; a group is rerun only when its
    /// highest-numbered run is errored. A failing rerun is logged and the
    /// remaining groups are still processed.
    #[instrument(skip(self))]
    pub async fn rerun_all_error_runs(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<ReplayReport>, EngineError> {
        let mut latest: BTreeMap<EventId, RunRecord> = BTreeMap::new();
        for run in self.store.list_runs(workflow_id).await? {
            match latest.get(&run.event_id) {
                Some(seen) if seen.number >= run.number => {}
                _ => {
                    latest.insert(run.event_id, run);
                }
            }
        }

        let mut reports = Vec::new();
        for run in latest.values().filter(|r| r.outcome.is_error()) {
            match self.rerun_workflow_from_event(run.id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(run_id = run.id, error = %e, "rerun failed"),
            }
        }
        info!(workflow_id, reran = reports.len(), "reran error runs");
        Ok(reports)
    }

    async fn load_replay_target(
        &self,
        result_id: StepResultId,
        source: ConfigSource,
    ) -> Result<ReplayTarget, EngineError> {
        let record = self.store.get_step_result(result_id).await?;
        let run = self.store.get_run(record.run_id).await?;
        let workflow = self.store.get_workflow(run.workflow_id).await?;

        let definition = match source {
            ConfigSource::Current => self.store.get_step(record.step_id).await?,
            ConfigSource::Historic => record.step_snapshot.clone(),
        };
        let input = match record.previous_id {
            Some(previous) => self.store.get_step_result(previous).await?.results,
            None => seed_results(&workflow, &run.event),
        };

        Ok(ReplayTarget {
            record,
            run,
            workflow,
            definition,
            input,
        })
    }

    /// Latest snapshot per step recorded in a run
    async fn run_snapshots(
        &self,
        run_id: RunId,
    ) -> Result<BTreeMap<StepId, StepDefinition>, EngineError> {
        Ok(self
            .store
            .list_step_results(run_id)
            .await?
            .into_iter()
            .map(|r| (r.step_id, r.step_snapshot))
            .collect())
    }

    fn replay_runner<'a>(&'a self, workflow: &'a Workflow, run: &'a RunRecord) -> ChainRun<'a> {
        ChainRun {
            store: self.store.as_ref(),
            workflow,
            queue_entry: None,
            event: &run.event,
            run_id: run.id,
            mode: ExecutionMode::Replay,
            now: Utc::now(),
            max_tries: self.config.max_tries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewEvent, NewStepDefinition, NewWorkflow, StepKind};
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    async fn processed_run(
        store: &InMemoryStore,
        engine: &AutomationEngine<InMemoryStore>,
    ) -> Workflow {
        let workflow = engine
            .create_workflow(
                NewWorkflow::new("wf", "course_viewed")
                    .with_step(NewStepDefinition::new(
                        StepKind::Lookup,
                        "event_fields",
                        json!({"fields": ["courseid"]}),
                    ))
                    .with_step(NewStepDefinition::new(
                        StepKind::Action,
                        "log_dump",
                        json!({"template": "course {courseid}"}),
                    )),
            )
            .await
            .unwrap();
        let now = Utc::now();
        engine
            .submit(
                NewEvent::new("course_viewed", now).with_field("courseid", 12),
                now,
            )
            .await
            .unwrap();
        engine.build_queue(now).await.unwrap();
        engine.process_due(now).await.unwrap();
        assert_eq!(store.list_runs(workflow.id).await.unwrap().len(), 1);
        workflow
    }

    #[tokio::test]
    async fn test_rerun_step_writes_sibling_record() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        let workflow = processed_run(&store, &engine).await;
        let run = store.list_runs(workflow.id).await.unwrap().remove(0);
        let original = store.list_step_results(run.id).await.unwrap();
        assert_eq!(original.len(), 2);

        let report = engine.rerun_step(original[1].id).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Succeeded);
        assert_eq!(report.results, original[1].results);

        let replayed = store.get_step_result(report.records[0]).await.unwrap();
        assert_eq!(replayed.previous_id, original[1].previous_id);
        assert_eq!(replayed.derived_from, Some(original[1].id));
        assert_eq!(replayed.sequence, 3);
    }

    #[tokio::test]
    async fn test_rerun_step_and_next_only_runs_one_more() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        let workflow = processed_run(&store, &engine).await;
        let run = store.list_runs(workflow.id).await.unwrap().remove(0);
        let original = store.list_step_results(run.id).await.unwrap();

        let report = engine
            .rerun_step_and_continue(original[0].id, false, ConfigSource::Historic)
            .await
            .unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.outcome, RunOutcome::Succeeded);

        let continued = store.get_step_result(report.records[1]).await.unwrap();
        assert_eq!(continued.previous_id, Some(report.records[0]));
        assert_eq!(continued.derived_from, None);
    }

    #[tokio::test]
    async fn test_rerun_workflow_numbers_new_run() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        let workflow = processed_run(&store, &engine).await;
        let first = store.list_runs(workflow.id).await.unwrap().remove(0);

        let report = engine.rerun_workflow_from_event(first.id).await.unwrap();
        let rerun = store.get_run(report.run_id).await.unwrap();
        assert_eq!(rerun.number, 2);
        assert_eq!(rerun.event_id, first.event_id);
        assert_eq!(rerun.outcome, RunOutcome::Succeeded);
        assert_eq!(report.records.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_record_is_an_error() {
        let engine = AutomationEngine::new(InMemoryStore::new());
        assert!(matches!(
            engine.rerun_step(42).await,
            Err(EngineError::Store(_))
        ));
    }
}
