//! Step registry for type-erased step construction
//!
//! Step definitions name their implementation by a string identifier. The
//! registry maps validated identifiers to factories, so only registered
//! types can ever be instantiated from stored configuration.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use super::{
    DebounceStep, EventFieldsStep, FailStep, FieldFilterStep, LogDumpStep, Step,
    StepConfigError, StepDescriptor, StepType,
};
use crate::model::{NewStepDefinition, NewWorkflow, StepDefinition, StepKind, Workflow};

/// Factory function type for building steps from configuration
pub type StepFactory =
    Box<dyn Fn(&Value) -> Result<Box<dyn Step>, StepConfigError> + Send + Sync>;

struct Registration {
    descriptor: StepDescriptor,
    factory: StepFactory,
}

/// Whether `id` is a valid identifier: `[a-z][a-z0-9_]*`
pub fn is_valid_identifier(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Registry of step types
pub struct StepRegistry {
    steps: BTreeMap<&'static str, Registration>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl StepRegistry {
    /// Create a registry with no step types
    pub fn empty() -> Self {
        Self {
            steps: BTreeMap::new(),
        }
    }

    /// Create a registry holding the built-in step types
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.insert::<DebounceStep>();
        registry.insert::<FieldFilterStep>();
        registry.insert::<FailStep>();
        registry.insert::<EventFieldsStep>();
        registry.insert::<LogDumpStep>();
        registry
    }

    /// Register a step type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = StepRegistry::with_builtins();
    /// registry.register::<SendEmailStep>()?;
    /// ```
    pub fn register<T: StepType>(&mut self) -> Result<(), RegistryError> {
        let type_id = T::DESCRIPTOR.type_id;
        if !is_valid_identifier(type_id) {
            return Err(RegistryError::InvalidTypeId(type_id.to_string()));
        }
        self.insert::<T>();
        Ok(())
    }

    fn insert<T: StepType>(&mut self) {
        let factory: StepFactory = Box::new(|config: &Value| {
            let step = T::from_config(config)?;
            Ok(Box::new(step) as Box<dyn Step>)
        });
        self.steps.insert(
            T::DESCRIPTOR.type_id,
            Registration {
                descriptor: T::DESCRIPTOR,
                factory,
            },
        );
    }

    /// Check if a step type is registered
    pub fn contains(&self, type_id: &str) -> bool {
        self.steps.contains_key(type_id)
    }

    /// Descriptor of a registered step type
    pub fn descriptor(&self, type_id: &str) -> Option<StepDescriptor> {
        self.steps.get(type_id).map(|r| r.descriptor)
    }

    /// Descriptors of all registered step types, by identifier
    pub fn descriptors(&self) -> Vec<StepDescriptor> {
        self.steps.values().map(|r| r.descriptor).collect()
    }

    fn build(
        &self,
        step_type: &str,
        kind: StepKind,
        config: &Value,
    ) -> Result<Box<dyn Step>, RegistryError> {
        if !is_valid_identifier(step_type) {
            return Err(RegistryError::InvalidTypeId(step_type.to_string()));
        }
        let registration = self
            .steps
            .get(step_type)
            .ok_or_else(|| RegistryError::UnknownStepType(step_type.to_string()))?;
        if registration.descriptor.kind != kind {
            return Err(RegistryError::KindMismatch {
                step_type: step_type.to_string(),
                expected: registration.descriptor.kind,
                actual: kind,
            });
        }
        (registration.factory)(config).map_err(|e| RegistryError::InvalidConfig {
            step_type: step_type.to_string(),
            message: e.0,
        })
    }

    /// Build a step from its stored definition
    pub fn resolve(&self, step: &StepDefinition) -> Result<Box<dyn Step>, RegistryError> {
        self.build(&step.step_type, step.kind, &step.config)
    }

    /// Build every step of a workflow, in chain order
    ///
    /// Fails as a whole when any step cannot be built, so a chain never
    /// starts with a step further down that is unusable.
    pub fn resolve_chain(&self, workflow: &Workflow) -> Result<Vec<Box<dyn Step>>, RegistryError> {
        workflow.steps.iter().map(|s| self.resolve(s)).collect()
    }

    /// Validate a step definition submitted by an administrator
    pub fn validate_step(&self, step: &NewStepDefinition) -> Result<(), RegistryError> {
        self.build(&step.step_type, step.kind, &step.config)
            .map(|_| ())
    }

    /// Validate a workflow submitted by an administrator
    pub fn validate_workflow(&self, workflow: &NewWorkflow) -> Result<(), RegistryError> {
        workflow
            .steps
            .iter()
            .try_for_each(|step| self.validate_step(step))
    }

    /// Get the number of registered step types
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    /// Identifier is not of the form `[a-z][a-z0-9_]*`
    #[error("invalid step type identifier: {0:?}")]
    InvalidTypeId(String),

    /// Step type not registered
    #[error("unknown step type: {0}")]
    UnknownStepType(String),

    /// Definition declares a different kind than the step type
    #[error("step type {step_type} is a {expected} step, not {actual}")]
    KindMismatch {
        step_type: String,
        expected: StepKind,
        actual: StepKind,
    },

    /// Configuration rejected by the step type
    #[error("invalid configuration for {step_type}: {message}")]
    InvalidConfig { step_type: String, message: String },
}
