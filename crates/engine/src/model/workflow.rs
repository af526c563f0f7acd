//! Workflow and step definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a workflow
pub type WorkflowId = i64;

/// Identifier of a step definition
pub type StepId = i64;

/// Role a step plays in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Trigger,
    Filter,
    Lookup,
    Action,
    Debounce,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Filter => "filter",
            Self::Lookup => "lookup",
            Self::Action => "action",
            Self::Debounce => "debounce",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trigger" => Ok(Self::Trigger),
            "filter" => Ok(Self::Filter),
            "lookup" => Ok(Self::Lookup),
            "action" => Ok(Self::Action),
            "debounce" => Ok(Self::Debounce),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// A configured step within a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub id: StepId,
    pub workflow_id: WorkflowId,
    pub kind: StepKind,

    /// Registered step type identifier (e.g. "field_filter")
    pub step_type: String,

    /// Position in the chain, ascending
    pub step_order: i32,
    pub name: String,
    pub description: String,

    /// Opaque step configuration, interpreted by the step type
    pub config: serde_json::Value,
}

/// An administrator-defined chain of steps bound to one event name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,

    /// Name of the event this workflow subscribes to
    pub event_name: String,
    pub enabled: bool,
    pub draft: bool,

    /// Run synchronously at submission time instead of through the queue
    pub realtime: bool,

    /// Log every step's result map
    pub debug: bool,
    pub last_triggered: Option<DateTime<Utc>>,

    /// Steps sorted by `step_order`
    pub steps: Vec<StepDefinition>,
}

impl Workflow {
    /// Whether the workflow takes part in subscriptions, queueing and processing
    pub fn is_active(&self) -> bool {
        self.enabled && !self.draft
    }

    /// Whether this workflow reacts to `event_name`
    pub fn subscribes_to(&self, event_name: &str) -> bool {
        self.is_active() && self.event_name == event_name
    }

    /// Position of a step in the ordered chain
    pub fn step_index(&self, step_id: StepId) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// Step definition as submitted by the editor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewStepDefinition {
    pub kind: StepKind,
    pub step_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl NewStepDefinition {
    pub fn new(kind: StepKind, step_type: impl Into<String>, config: serde_json::Value) -> Self {
        let step_type = step_type.into();
        Self {
            kind,
            name: step_type.clone(),
            step_type,
            description: String::new(),
            config,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Workflow as submitted by the editor; steps are ordered by position
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub event_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub realtime: bool,
    #[serde(default)]
    pub debug: bool,
    pub steps: Vec<NewStepDefinition>,
}

impl NewWorkflow {
    /// An enabled, queued workflow with no steps
    pub fn new(name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            event_name: event_name.into(),
            enabled: true,
            draft: false,
            realtime: false,
            debug: false,
            steps: vec![],
        }
    }

    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn with_step(mut self, step: NewStepDefinition) -> Self {
        self.steps.push(step);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_round_trips_through_str() {
        for kind in [
            StepKind::Trigger,
            StepKind::Filter,
            StepKind::Lookup,
            StepKind::Action,
            StepKind::Debounce,
        ] {
            assert_eq!(kind.as_str().parse::<StepKind>(), Ok(kind));
        }
        assert!("shell".parse::<StepKind>().is_err());
    }

    #[test]
    fn test_draft_workflows_do_not_subscribe() {
        let mut workflow = Workflow {
            id: 1,
            name: "w".into(),
            description: String::new(),
            event_name: "course_viewed".into(),
            enabled: true,
            draft: true,
            realtime: false,
            debug: false,
            last_triggered: None,
            steps: vec![],
        };
        assert!(!workflow.subscribes_to("course_viewed"));

        workflow.draft = false;
        assert!(workflow.subscribes_to("course_viewed"));
        assert!(!workflow.subscribes_to("course_deleted"));
    }
}
