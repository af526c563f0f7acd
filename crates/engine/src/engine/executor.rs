//! Automation engine
//!
//! The `AutomationEngine` ties the store, the step registry and the
//! configuration together. Its operations are spread over the sibling
//! modules by concern:
//! - intake: event submission and realtime execution
//! - queue builder and processor: the asynchronous path
//! - replay: administrator re-executions from history
//! - retention: cleanup of old events, entries and runs

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::model::{NewStepDefinition, NewWorkflow, StepDefinition, StepId, Workflow, WorkflowId};
use crate::persistence::{AutomationStore, StoreError};
use crate::step::{RegistryError, StepRegistry, StepType};

use super::intake::SubscriptionCache;

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workflow rejected at the administrative boundary
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Replay request cannot be carried out
    #[error("invalid replay: {0}")]
    InvalidReplay(String),
}

/// Workflow automation engine
///
/// Execution is single-writer: one queue entry at a time, one step at a
/// time. Run one processing loop per store.
///
/// # Example
///
/// ```ignore
/// use tripwire_engine::prelude::*;
///
/// let engine = AutomationEngine::new(InMemoryStore::new());
/// engine.create_workflow(NewWorkflow::new("notify", "course_viewed")).await?;
///
/// engine.submit(NewEvent::new("course_viewed", Utc::now()), Utc::now()).await?;
/// engine.build_queue(Utc::now()).await?;
/// engine.process_queue(Utc::now(), 500, Duration::from_secs(60)).await?;
/// ```
pub struct AutomationEngine<S: AutomationStore> {
    pub(super) store: Arc<S>,
    pub(super) registry: StepRegistry,
    pub(super) config: EngineConfig,
    pub(super) subscriptions: SubscriptionCache,
}

impl<S: AutomationStore> AutomationEngine<S> {
    /// Create a new engine with the built-in step types
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create a new engine with custom config
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(store),
            registry: StepRegistry::with_builtins(),
            config,
            subscriptions: SubscriptionCache::default(),
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Register an additional step type
    pub fn register_step<T: StepType>(&mut self) -> Result<(), RegistryError> {
        self.registry.register::<T>()?;
        info!(step_type = T::DESCRIPTOR.type_id, "registered step type");
        Ok(())
    }

    /// Validate and store a workflow
    ///
    /// Unknown step types, kind mismatches and invalid step configuration are
    /// rejected here, before anything is written.
    #[instrument(skip(self, workflow), fields(name = %workflow.name))]
    pub async fn create_workflow(&self, workflow: NewWorkflow) -> Result<Workflow, EngineError> {
        if workflow.name.trim().is_empty() {
            return Err(EngineError::InvalidWorkflow("name must not be empty".into()));
        }
        if workflow.event_name.trim().is_empty() {
            return Err(EngineError::InvalidWorkflow(
                "event name must not be empty".into(),
            ));
        }
        self.registry.validate_workflow(&workflow)?;

        let workflow = self.store.create_workflow(workflow).await?;
        self.subscriptions.invalidate();
        info!(
            workflow_id = workflow.id,
            event_name = %workflow.event_name,
            steps = workflow.steps.len(),
            "created workflow"
        );
        Ok(workflow)
    }

    /// Validate and replace a step's configuration
    #[instrument(skip(self, config))]
    pub async fn update_step_config(
        &self,
        step_id: StepId,
        config: Value,
    ) -> Result<StepDefinition, EngineError> {
        let current = self.store.get_step(step_id).await?;
        self.registry.validate_step(&NewStepDefinition {
            kind: current.kind,
            step_type: current.step_type.clone(),
            name: current.name.clone(),
            description: current.description.clone(),
            config: config.clone(),
        })?;
        Ok(self.store.update_step_config(step_id, config).await?)
    }

    #[instrument(skip(self))]
    pub async fn set_workflow_enabled(
        &self,
        workflow_id: WorkflowId,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.store.set_workflow_enabled(workflow_id, enabled).await?;
        self.subscriptions.invalidate();
        Ok(())
    }

    /// Drop the cached subscription set; the next submission rebuilds it
    pub fn invalidate_subscriptions(&self) {
        self.subscriptions.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepKind;
    use crate::persistence::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_workflow_validates_steps() {
        let engine = AutomationEngine::new(InMemoryStore::new());

        let unknown = NewWorkflow::new("wf", "course_viewed").with_step(NewStepDefinition::new(
            StepKind::Action,
            "send_email",
            json!({}),
        ));
        assert!(matches!(
            engine.create_workflow(unknown).await,
            Err(EngineError::Registry(RegistryError::UnknownStepType(_)))
        ));

        let bad_fields = NewWorkflow::new("wf", "course_viewed").with_step(
            NewStepDefinition::new(
                StepKind::Debounce,
                "debounce",
                json!({"fields": ["Not Valid"], "duration": 60}),
            ),
        );
        assert!(matches!(
            engine.create_workflow(bad_fields).await,
            Err(EngineError::Registry(RegistryError::InvalidConfig { .. }))
        ));

        assert!(matches!(
            engine.create_workflow(NewWorkflow::new("wf", " ")).await,
            Err(EngineError::InvalidWorkflow(_))
        ));
        assert!(engine.store().list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_step_config_validates() {
        let engine = AutomationEngine::new(InMemoryStore::new());
        let workflow = engine
            .create_workflow(NewWorkflow::new("wf", "course_viewed").with_step(
                NewStepDefinition::new(StepKind::Action, "log_dump", json!({"template": "a"})),
            ))
            .await
            .unwrap();
        let step_id = workflow.steps[0].id;

        assert!(engine
            .update_step_config(step_id, json!({"template": ""}))
            .await
            .is_err());
        let updated = engine
            .update_step_config(step_id, json!({"template": "b"}))
            .await
            .unwrap();
        assert_eq!(updated.config, json!({"template": "b"}));
    }
}
