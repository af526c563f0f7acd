//! End-to-end engine tests against the in-memory store
//!
//! Run with: cargo test -p tripwire-engine --test engine_integration_test

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use tripwire_engine::model::{
    Event, NewEvent, NewQueueEntry, NewStepDefinition, NewWorkflow, QueueEntry, QueueStatus,
    ResultMap, RunOutcome, StepKind, Workflow,
};
use tripwire_engine::persistence::{AutomationStore, InMemoryStore, StoreTransaction};
use tripwire_engine::step::{
    Step, StepConfigError, StepContext, StepDescriptor, StepError, StepOutcome, StepType,
};
use tripwire_engine::{AutomationEngine, ConfigSource, EngineConfig};

// ============================================
// Test steps
// ============================================

/// Always raises
struct ExplodeStep;

impl StepType for ExplodeStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "explode",
        kind: StepKind::Action,
        name: "Explode",
        description: "Always fails with an error",
        output_fields: &[],
    };

    fn from_config(_config: &Value) -> Result<Self, StepConfigError> {
        Ok(Self)
    }
}

#[async_trait]
impl Step for ExplodeStep {
    async fn execute(
        &self,
        _ctx: &StepContext<'_>,
        _tx: &mut dyn StoreTransaction,
        _event: &Event,
        _results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        Err(StepError::new("remote service unavailable").with_type("http"))
    }
}

/// Takes ten seconds of tokio time
struct SlowStep;

impl StepType for SlowStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "slow",
        kind: StepKind::Action,
        name: "Slow",
        description: "Sleeps before continuing",
        output_fields: &[],
    };

    fn from_config(_config: &Value) -> Result<Self, StepConfigError> {
        Ok(Self)
    }
}

#[async_trait]
impl Step for SlowStep {
    async fn execute(
        &self,
        _ctx: &StepContext<'_>,
        _tx: &mut dyn StoreTransaction,
        _event: &Event,
        results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(StepOutcome::Continue(results))
    }
}

// ============================================
// Helpers
// ============================================

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
}

fn lookup() -> NewStepDefinition {
    NewStepDefinition::new(
        StepKind::Lookup,
        "event_fields",
        json!({"fields": ["courseid", "userid"]}),
    )
}

fn filter(config: Value) -> NewStepDefinition {
    NewStepDefinition::new(StepKind::Filter, "field_filter", config)
}

fn action() -> NewStepDefinition {
    NewStepDefinition::new(
        StepKind::Action,
        "log_dump",
        json!({"template": "user {userid} viewed course {courseid}"}),
    )
}

fn debounce(duration: u64) -> NewStepDefinition {
    NewStepDefinition::new(
        StepKind::Debounce,
        "debounce",
        json!({"fields": ["courseid"], "duration": duration}),
    )
}

fn course_viewed(at: DateTime<Utc>, course: i64) -> NewEvent {
    NewEvent::new("course_viewed", at).with_field("courseid", course)
}

async fn engine_with(workflow: NewWorkflow) -> (AutomationEngine<InMemoryStore>, InMemoryStore, Workflow) {
    let store = InMemoryStore::new();
    let engine = AutomationEngine::new(store.clone());
    let workflow = engine.create_workflow(workflow).await.unwrap();
    (engine, store, workflow)
}

fn entry_for<'a>(entries: &'a [QueueEntry], id: i64) -> &'a QueueEntry {
    entries.iter().find(|e| e.id == id).unwrap()
}

// ============================================
// Queue Builder Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_build_queue_twice_creates_no_duplicates() {
    let store = InMemoryStore::new();
    let engine = AutomationEngine::new(store.clone());
    let queued = engine
        .create_workflow(NewWorkflow::new("queued", "course_viewed").with_step(action()))
        .await
        .unwrap();
    let realtime = engine
        .create_workflow(
            NewWorkflow::new("realtime", "course_viewed")
                .realtime()
                .with_step(action()),
        )
        .await
        .unwrap();

    for i in 0..3 {
        engine.submit(course_viewed(at(i), i), at(i)).await.unwrap();
    }

    assert_eq!(engine.build_queue(at(10)).await.unwrap(), 3);
    assert_eq!(engine.build_queue(at(11)).await.unwrap(), 0);

    let entries = store.list_queue_entries(queued.id).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.tries == 0 && e.status == QueueStatus::Ready));
    assert!(store
        .list_queue_entries(realtime.id)
        .await
        .unwrap()
        .is_empty());
}

// ============================================
// Pipeline Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_failing_filter_short_circuits_chain() {
    let (engine, store, workflow) = engine_with(
        NewWorkflow::new("wf", "course_viewed")
            .with_step(lookup())
            .with_step(filter(json!({"field": "courseid", "value": 99})))
            .with_step(action()),
    )
    .await;

    engine.submit(course_viewed(at(0), 3), at(0)).await.unwrap();
    engine.build_queue(at(0)).await.unwrap();
    let report = engine.process_due(at(1)).await.unwrap();
    assert_eq!(report.finished_early, 1);

    let entry = store.list_queue_entries(workflow.id).await.unwrap().remove(0);
    assert_eq!(entry.status, QueueStatus::FinishedEarly);
    assert_eq!(entry.last_step_attempted, Some(workflow.steps[1].id));
    assert_eq!(entry.tries, 1);

    let run = store.list_runs(workflow.id).await.unwrap().remove(0);
    assert_eq!(run.outcome.badge(), "failed at step 2");

    // Only the lookup produced a record; the action never ran
    let records = store.list_step_results(run.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].step_id, workflow.steps[0].id);
    assert!(records
        .iter()
        .all(|r| !r.results.contains_key("logged_message")));

    // Halted entries are not retried
    assert_eq!(engine.process_due(at(2)).await.unwrap().selected, 0);
}

#[test_log::test(tokio::test)]
async fn test_error_retries_until_max_tries() {
    let store = InMemoryStore::new();
    let mut engine =
        AutomationEngine::with_config(store.clone(), EngineConfig::default().with_max_tries(3));
    engine.register_step::<ExplodeStep>().unwrap();
    let workflow = engine
        .create_workflow(NewWorkflow::new("wf", "course_viewed").with_step(
            NewStepDefinition::new(StepKind::Action, "explode", json!({})),
        ))
        .await
        .unwrap();

    engine.submit(course_viewed(at(0), 1), at(0)).await.unwrap();
    engine.build_queue(at(0)).await.unwrap();

    for round in 1..=5 {
        let report = engine.process_due(at(round)).await.unwrap();
        let entry = store.list_queue_entries(workflow.id).await.unwrap().remove(0);
        assert!(entry.tries <= 3);
        if round <= 3 {
            assert_eq!(report.retried, 1);
            assert_eq!(entry.tries, round as u32);
        } else {
            assert_eq!(report.selected, 0);
        }
    }

    let entry = store.list_queue_entries(workflow.id).await.unwrap().remove(0);
    assert_eq!(entry.status, QueueStatus::Ready);
    assert_eq!(entry.tries, 3);
    assert_eq!(entry.last_step_attempted, Some(workflow.steps[0].id));

    let runs = store.list_runs(workflow.id).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs.iter().map(|r| r.number).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(runs.iter().all(|r| r.outcome.badge() == "error at step 1"));
}

#[test_log::test(tokio::test)]
async fn test_debug_workflow_logs_and_completes() {
    let (engine, store, workflow) = engine_with(
        NewWorkflow::new("wf", "course_viewed")
            .with_debug()
            .with_step(lookup())
            .with_step(action()),
    )
    .await;

    engine.submit(course_viewed(at(1), 5), at(1)).await.unwrap();
    engine.build_queue(at(1)).await.unwrap();
    assert_eq!(engine.process_due(at(2)).await.unwrap().finished, 1);

    let run = store.list_runs(workflow.id).await.unwrap().remove(0);
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert_eq!(store.list_step_results(run.id).await.unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_history_chain_is_linked() {
    let (engine, store, workflow) = engine_with(
        NewWorkflow::new("wf", "course_viewed")
            .with_step(lookup())
            .with_step(filter(json!({"field": "courseid", "value": 3})))
            .with_step(action()),
    )
    .await;

    engine.submit(course_viewed(at(0), 3), at(0)).await.unwrap();
    engine.build_queue(at(0)).await.unwrap();
    assert_eq!(engine.process_due(at(1)).await.unwrap().finished, 1);

    let run = store.list_runs(workflow.id).await.unwrap().remove(0);
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    let records = store.list_step_results(run.id).await.unwrap();
    assert_eq!(records.len(), 3);

    let mut visited = Vec::new();
    let mut cursor = records.last().map(|r| r.id);
    while let Some(id) = cursor {
        let record = store.get_step_result(id).await.unwrap();
        cursor = record.previous_id;
        visited.push(record);
    }
    assert_eq!(visited.len(), 3);
    for pair in visited.windows(2) {
        assert!(pair[0].id > pair[1].id);
        assert!(pair[0].sequence > pair[1].sequence);
        assert!(pair[0].executed_at >= pair[1].executed_at);
    }
    assert_eq!(
        visited[0].results.get("logged_message"),
        Some(&json!("user {userid} viewed course 3"))
    );
}

// ============================================
// Realtime Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_realtime_failure_does_not_block_other_workflows() {
    let store = InMemoryStore::new();
    let mut engine = AutomationEngine::new(store.clone());
    engine.register_step::<ExplodeStep>().unwrap();
    let failing = engine
        .create_workflow(
            NewWorkflow::new("failing", "course_viewed")
                .realtime()
                .with_step(NewStepDefinition::new(StepKind::Action, "explode", json!({}))),
        )
        .await
        .unwrap();
    let healthy = engine
        .create_workflow(
            NewWorkflow::new("healthy", "course_viewed")
                .realtime()
                .with_step(lookup())
                .with_step(action()),
        )
        .await
        .unwrap();

    let report = engine.submit(course_viewed(at(0), 8), at(0)).await.unwrap();
    assert_eq!(report.realtime_finished, 1);
    assert_eq!(report.realtime_queued, 1);

    let healthy_runs = store.list_runs(healthy.id).await.unwrap();
    assert_eq!(healthy_runs[0].outcome, RunOutcome::Succeeded);
    assert!(store.list_queue_entries(healthy.id).await.unwrap().is_empty());

    let retry = store.list_queue_entries(failing.id).await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].tries, 1);
    assert_eq!(retry[0].status, QueueStatus::Ready);

    for id in [failing.id, healthy.id] {
        let workflow = store.get_workflow(id).await.unwrap();
        assert_eq!(workflow.last_triggered, Some(at(0)));
    }
}

// ============================================
// Debounce Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_debounce_latest_unscheduled_event_wins() {
    let (engine, store, workflow) = engine_with(
        NewWorkflow::new("wf", "course_viewed")
            .with_step(debounce(60))
            .with_step(action()),
    )
    .await;

    let mut event_ids = Vec::new();
    for t in [1, 2, 3] {
        let report = engine.submit(course_viewed(at(t), 5), at(t)).await.unwrap();
        event_ids.push(report.event_id.unwrap());
        engine.build_queue(at(t)).await.unwrap();
    }
    // A different course never coalesces with the burst
    engine.submit(course_viewed(at(4), 6), at(4)).await.unwrap();
    engine.build_queue(at(4)).await.unwrap();

    // First pass: every original defers to a clone
    let first = engine.process_due(at(10)).await.unwrap();
    assert_eq!(first.deferred, 4);
    assert_eq!(engine.process_due(at(11)).await.unwrap().selected, 0);

    // Decision pass once the clones are due
    let decision = engine.process_due(at(70)).await.unwrap();
    assert_eq!(decision.finished, 2);
    assert_eq!(decision.cancelled, 1);
    assert_eq!(decision.skipped, 1);

    let entries = store.list_queue_entries(workflow.id).await.unwrap();
    let clones: Vec<&QueueEntry> = entries
        .iter()
        .filter(|e| e.execution_time.is_some() && event_ids.contains(&e.event_id))
        .collect();
    assert_eq!(clones.len(), 3);
    let finished: Vec<&&QueueEntry> = clones
        .iter()
        .filter(|e| e.status == QueueStatus::Finished)
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].event_id, event_ids[2]);
    assert_eq!(
        clones
            .iter()
            .filter(|e| e.status == QueueStatus::Cancelled)
            .count(),
        2
    );
    assert!(entries
        .iter()
        .filter(|e| e.execution_time.is_none())
        .all(|e| e.status == QueueStatus::Deferred));

    // Both losers have a cancelled run in history
    let runs = store.list_runs(workflow.id).await.unwrap();
    let cancelled: Vec<i64> = runs
        .iter()
        .filter(|r| matches!(r.outcome, RunOutcome::Cancelled { .. }))
        .map(|r| r.event_id)
        .collect();
    assert_eq!(cancelled.len(), 2);
    assert!(!cancelled.contains(&event_ids[2]));
    assert!(runs
        .iter()
        .any(|r| r.event_id == event_ids[2] && r.outcome == RunOutcome::Succeeded));
}

#[test_log::test(tokio::test)]
async fn test_debounce_latest_execution_time_wins() {
    // Every creation order of the entries scheduled at +5, +10 and +15
    let orders = [
        [5, 10, 15],
        [5, 15, 10],
        [10, 5, 15],
        [10, 15, 5],
        [15, 5, 10],
        [15, 10, 5],
    ];

    for order in orders {
        let (engine, store, workflow) = engine_with(
            NewWorkflow::new("wf", "course_viewed")
                .with_step(debounce(60))
                .with_step(action()),
        )
        .await;

        let mut scheduled = Vec::new();
        for (created, offset) in order.into_iter().enumerate() {
            let event = store
                .insert_event(course_viewed(at(created as i64), 5))
                .await
                .unwrap()
                .event;
            let id = store
                .insert_queue_entry(
                    NewQueueEntry::ready(workflow.id, event.id, at(created as i64))
                        .with_execution_time(at(offset)),
                )
                .await
                .unwrap();
            scheduled.push((offset, id));
        }

        let report = engine.process_due(at(20)).await.unwrap();
        assert_eq!(report.finished, 1, "order {order:?}");

        let entries = store.list_queue_entries(workflow.id).await.unwrap();
        for (offset, id) in scheduled {
            let expected = if offset == 15 {
                QueueStatus::Finished
            } else {
                QueueStatus::Cancelled
            };
            assert_eq!(entry_for(&entries, id).status, expected, "order {order:?}");
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_debounce_ignores_exhausted_entries() {
    let store = InMemoryStore::new();
    let engine =
        AutomationEngine::with_config(store.clone(), EngineConfig::default().with_max_tries(3));
    let workflow = engine
        .create_workflow(
            NewWorkflow::new("wf", "course_viewed")
                .with_step(debounce(60))
                .with_step(action()),
        )
        .await
        .unwrap();

    // Gave up on after three errors, still ready
    let stale = store
        .insert_event(course_viewed(at(0), 5))
        .await
        .unwrap()
        .event;
    let stale_entry = store
        .insert_queue_entry(NewQueueEntry::ready(workflow.id, stale.id, at(0)).with_tries(3))
        .await
        .unwrap();

    engine.submit(course_viewed(at(1), 5), at(1)).await.unwrap();
    assert_eq!(engine.build_queue(at(1)).await.unwrap(), 1);
    assert_eq!(engine.process_due(at(10)).await.unwrap().deferred, 1);

    let decision = engine.process_due(at(70)).await.unwrap();
    assert_eq!(decision.finished, 1);
    assert_eq!(decision.cancelled, 0);

    let entries = store.list_queue_entries(workflow.id).await.unwrap();
    let stale_entry = entry_for(&entries, stale_entry);
    assert_eq!(stale_entry.status, QueueStatus::Ready);
    assert_eq!(stale_entry.tries, 3);
    assert!(store
        .list_runs(workflow.id)
        .await
        .unwrap()
        .iter()
        .all(|r| r.event_id != stale.id));
}

// ============================================
// Replay Tests
// ============================================

#[test_log::test(tokio::test)]
async fn test_replay_uses_current_or_historic_config() {
    let (engine, store, workflow) = engine_with(
        NewWorkflow::new("wf", "course_viewed")
            .with_step(lookup())
            .with_step(action()),
    )
    .await;

    engine.submit(course_viewed(at(0), 3), at(0)).await.unwrap();
    engine.build_queue(at(0)).await.unwrap();
    engine.process_due(at(1)).await.unwrap();

    let run = store.list_runs(workflow.id).await.unwrap().remove(0);
    let original = store.list_step_results(run.id).await.unwrap().remove(0);

    let historic = engine.rerun_step_historic(original.id).await.unwrap();
    assert_eq!(historic.results, original.results);

    engine
        .update_step_config(
            workflow.steps[0].id,
            json!({"fields": ["courseid"], "prefix": "course_"}),
        )
        .await
        .unwrap();

    let current = engine.rerun_step(original.id).await.unwrap();
    assert_ne!(current.results, original.results);
    assert_eq!(current.results.get("course_courseid"), Some(&json!(3)));

    let historic = engine.rerun_step_historic(original.id).await.unwrap();
    assert_eq!(historic.results, original.results);

    // Replays are siblings of the original record
    let sibling = store.get_step_result(historic.records[0]).await.unwrap();
    assert_eq!(sibling.previous_id, original.previous_id);
    assert_eq!(sibling.derived_from, Some(original.id));
}

#[test_log::test(tokio::test)]
async fn test_rerun_step_and_finish_runs_remaining_steps() {
    let (engine, store, workflow) = engine_with(
        NewWorkflow::new("wf", "course_viewed")
            .with_step(lookup())
            .with_step(filter(json!({"field": "courseid", "value": 3})))
            .with_step(action()),
    )
    .await;

    engine.submit(course_viewed(at(0), 3), at(0)).await.unwrap();
    engine.build_queue(at(0)).await.unwrap();
    engine.process_due(at(1)).await.unwrap();
    let run = store.list_runs(workflow.id).await.unwrap().remove(0);
    let original = store.list_step_results(run.id).await.unwrap();

    let report = engine
        .rerun_step_and_continue(original[0].id, true, ConfigSource::Current)
        .await
        .unwrap();
    assert_eq!(report.records.len(), 3);
    assert_eq!(report.outcome, RunOutcome::Succeeded);
    assert_eq!(report.results, original[2].results);

    // The run's log now holds both passes
    let records = store.list_step_results(run.id).await.unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records[3].derived_from, Some(original[0].id));
    assert_eq!(records[4].previous_id, Some(records[3].id));
}

#[test_log::test(tokio::test)]
async fn test_rerun_all_error_runs_skips_recovered_events() {
    let store = InMemoryStore::new();
    let mut engine = AutomationEngine::new(store.clone());
    engine.register_step::<ExplodeStep>().unwrap();
    let workflow = engine
        .create_workflow(
            NewWorkflow::new("wf", "course_viewed")
                .with_step(filter(json!({"field": "courseid", "value": 1})))
                .with_step(NewStepDefinition::new(StepKind::Action, "explode", json!({}))),
        )
        .await
        .unwrap();

    engine.submit(course_viewed(at(0), 1), at(0)).await.unwrap();
    engine.submit(course_viewed(at(0), 2), at(0)).await.unwrap();
    engine.build_queue(at(0)).await.unwrap();
    engine.process_due(at(1)).await.unwrap();

    // Course 1 errors at the second step, course 2 halts at the filter
    let runs = store.list_runs(workflow.id).await.unwrap();
    assert_eq!(runs[0].outcome.badge(), "error at step 2");
    assert_eq!(runs[1].outcome.badge(), "failed at step 1");

    let reports = engine.rerun_all_error_runs(workflow.id).await.unwrap();
    assert_eq!(reports.len(), 1);
    let rerun = store.get_run(reports[0].run_id).await.unwrap();
    assert_eq!(rerun.event_id, runs[0].event_id);
    assert_eq!(rerun.number, 2);

    // Once the filter rejects course 1 its latest run is no longer an error
    engine
        .update_step_config(workflow.steps[0].id, json!({"field": "courseid", "value": 5}))
        .await
        .unwrap();
    let reports = engine.rerun_all_error_runs(workflow.id).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome.badge(), "failed at step 1");
    assert!(engine
        .rerun_all_error_runs(workflow.id)
        .await
        .unwrap()
        .is_empty());
}

// ============================================
// Budget Tests
// ============================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_budget_is_checked_between_entries() {
    let store = InMemoryStore::new();
    let mut engine = AutomationEngine::new(store.clone());
    engine.register_step::<SlowStep>().unwrap();
    let workflow = engine
        .create_workflow(
            NewWorkflow::new("wf", "course_viewed")
                .with_step(NewStepDefinition::new(StepKind::Action, "slow", json!({}))),
        )
        .await
        .unwrap();
    for i in 0..3 {
        engine.submit(course_viewed(at(i), i), at(i)).await.unwrap();
    }
    engine.build_queue(at(5)).await.unwrap();

    let report = engine
        .process_queue(at(6), 10, Duration::from_secs(15))
        .await
        .unwrap();
    assert_eq!(report.selected, 3);
    assert_eq!(report.finished, 2);
    assert!(report.budget_exhausted);

    let entries = store.list_queue_entries(workflow.id).await.unwrap();
    assert_eq!(entries[2].status, QueueStatus::Ready);
    assert_eq!(entries[2].tries, 0);

    // A zero budget still makes progress
    let report = engine
        .process_queue(at(7), 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(report.finished, 1);
}
