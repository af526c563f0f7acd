//! Lookup steps

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    is_valid_identifier, Step, StepConfigError, StepContext, StepDescriptor, StepError,
    StepOutcome, StepType,
};
use crate::model::{Event, ResultMap, StepKind};
use crate::persistence::StoreTransaction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFieldsConfig {
    pub fields: Vec<String>,

    /// Prepended to every copied key
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Copies event fields into the result map
#[derive(Debug, Clone)]
pub struct EventFieldsStep {
    config: EventFieldsConfig,
}

impl StepType for EventFieldsStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "event_fields",
        kind: StepKind::Lookup,
        name: "Event fields",
        description: "Adds selected event fields to the workflow data",
        output_fields: &[],
    };

    fn from_config(config: &Value) -> Result<Self, StepConfigError> {
        let config: EventFieldsConfig = serde_json::from_value(config.clone())?;
        if let Some(bad) = config.fields.iter().find(|f| !is_valid_identifier(f)) {
            return Err(StepConfigError(format!("invalid field name: {bad:?}")));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Step for EventFieldsStep {
    async fn execute(
        &self,
        _ctx: &StepContext<'_>,
        _tx: &mut dyn StoreTransaction,
        event: &Event,
        mut results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        let prefix = self.config.prefix.as_deref().unwrap_or_default();
        for field in &self.config.fields {
            if let Some(value) = event.field(field) {
                results.insert(format!("{prefix}{field}"), value);
            }
        }
        Ok(StepOutcome::Continue(results))
    }
}
