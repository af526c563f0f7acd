//! Action steps

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::template::render;
use super::{
    lookup_field, ActingAs, Step, StepConfigError, StepContext, StepDescriptor, StepError,
    StepOutcome, StepType,
};
use crate::model::{Event, ResultMap, StepKind};
use crate::persistence::StoreTransaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDumpConfig {
    /// Message with `{field}` placeholders
    pub template: String,

    /// Act as the user who caused the event
    #[serde(default)]
    pub as_event_user: bool,
}

/// Writes a rendered message to the log
#[derive(Debug, Clone)]
pub struct LogDumpStep {
    config: LogDumpConfig,
}

impl LogDumpStep {
    fn emit(&self, ctx: &StepContext<'_>, event: &Event, mut results: ResultMap) -> ResultMap {
        let message = render(&self.config.template, |name| {
            lookup_field(&results, event, name)
        });
        info!(
            workflow_id = ctx.workflow.id,
            step_id = ctx.step.id,
            acting_as = %ctx.acting_as(),
            "{}",
            message
        );
        results.insert("logged_message".to_string(), Value::String(message));
        results
    }
}

impl StepType for LogDumpStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "log_dump",
        kind: StepKind::Action,
        name: "Log message",
        description: "Renders a message from the workflow data and logs it",
        output_fields: &["logged_message"],
    };

    fn from_config(config: &Value) -> Result<Self, StepConfigError> {
        let config: LogDumpConfig = serde_json::from_value(config.clone())?;
        if config.template.trim().is_empty() {
            return Err(StepConfigError("template must not be empty".to_string()));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Step for LogDumpStep {
    async fn execute(
        &self,
        ctx: &StepContext<'_>,
        _tx: &mut dyn StoreTransaction,
        event: &Event,
        results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        let user_id = event.context.user_id.filter(|_| self.config.as_event_user);
        let results = match user_id {
            Some(user_id) => {
                let scoped = ctx.impersonate(ActingAs::User { user_id });
                self.emit(&scoped, event, results)
            }
            None => self.emit(ctx, event, results),
        };
        Ok(StepOutcome::Continue(results))
    }
}
