//! Filter steps

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::template::scalar_text;
use super::{
    is_valid_identifier, lookup_field, Step, StepConfigError, StepContext, StepDescriptor,
    StepError, StepOutcome, StepType,
};
use crate::model::{Event, ResultMap, StepKind};
use crate::persistence::StoreTransaction;

/// Comparison applied by [`FieldFilterStep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[default]
    Equals,
    NotEquals,
    Contains,
    Exists,
    NotExists,
}

impl FilterOperator {
    fn needs_value(&self) -> bool {
        matches!(self, Self::Equals | Self::NotEquals | Self::Contains)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilterConfig {
    pub field: String,
    #[serde(default)]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<Value>,
}

/// Continues only when a field satisfies a condition
#[derive(Debug, Clone)]
pub struct FieldFilterStep {
    config: FieldFilterConfig,
}

/// Equality that treats `7` and `"7"` alike
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        _ => scalar_text(a) == scalar_text(b),
    }
}

impl FieldFilterStep {
    fn holds(&self, actual: Option<&Value>) -> bool {
        let actual = actual.filter(|v| !v.is_null());
        let Some(expected) = self.config.value.as_ref() else {
            return match self.config.operator {
                FilterOperator::Exists => actual.is_some(),
                FilterOperator::NotExists => actual.is_none(),
                _ => false,
            };
        };
        match (self.config.operator, actual) {
            (FilterOperator::Exists, a) => a.is_some(),
            (FilterOperator::NotExists, a) => a.is_none(),
            (FilterOperator::Equals, Some(a)) => loosely_equal(a, expected),
            (FilterOperator::NotEquals, Some(a)) => !loosely_equal(a, expected),
            (FilterOperator::NotEquals, None) => true,
            (FilterOperator::Contains, Some(Value::Array(items))) => {
                items.iter().any(|item| loosely_equal(item, expected))
            }
            (FilterOperator::Contains, Some(a)) => {
                scalar_text(a).contains(&scalar_text(expected))
            }
            (_, None) => false,
        }
    }
}

impl StepType for FieldFilterStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "field_filter",
        kind: StepKind::Filter,
        name: "Field filter",
        description: "Continues when a result or event field matches a condition",
        output_fields: &[],
    };

    fn from_config(config: &Value) -> Result<Self, StepConfigError> {
        let config: FieldFilterConfig = serde_json::from_value(config.clone())?;
        if !is_valid_identifier(&config.field) {
            return Err(StepConfigError(format!(
                "invalid field name: {:?}",
                config.field
            )));
        }
        if config.operator.needs_value() && config.value.is_none() {
            return Err(StepConfigError(format!(
                "operator {:?} requires a value",
                config.operator
            )));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Step for FieldFilterStep {
    async fn execute(
        &self,
        _ctx: &StepContext<'_>,
        _tx: &mut dyn StoreTransaction,
        event: &Event,
        results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        let actual = lookup_field(&results, event, &self.config.field);
        if self.holds(actual.as_ref()) {
            Ok(StepOutcome::Continue(results))
        } else {
            Ok(StepOutcome::Halt(results))
        }
    }
}

/// Stops every chain it is part of
#[derive(Debug, Clone, Copy, Default)]
pub struct FailStep;

impl StepType for FailStep {
    const DESCRIPTOR: StepDescriptor = StepDescriptor {
        type_id: "fail",
        kind: StepKind::Filter,
        name: "Fail",
        description: "Always stops the workflow",
        output_fields: &[],
    };

    fn from_config(_config: &Value) -> Result<Self, StepConfigError> {
        Ok(Self)
    }
}

#[async_trait]
impl Step for FailStep {
    async fn execute(
        &self,
        _ctx: &StepContext<'_>,
        _tx: &mut dyn StoreTransaction,
        _event: &Event,
        results: ResultMap,
    ) -> Result<StepOutcome, StepError> {
        Ok(StepOutcome::Halt(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(config: Value) -> FieldFilterStep {
        FieldFilterStep::from_config(&config).unwrap()
    }

    #[test]
    fn test_equals_is_loose_on_scalars() {
        let step = filter(json!({"field": "courseid", "value": 42}));
        assert!(step.holds(Some(&json!("42"))));
        assert!(step.holds(Some(&json!(42))));
        assert!(!step.holds(Some(&json!(43))));
        assert!(!step.holds(None));
    }

    #[test]
    fn test_not_equals_and_contains() {
        let step = filter(json!({"field": "f", "operator": "not_equals", "value": "a"}));
        assert!(step.holds(Some(&json!("b"))));
        assert!(step.holds(None));
        assert!(!step.holds(Some(&json!("a"))));

        let step = filter(json!({"field": "f", "operator": "contains", "value": "ell"}));
        assert!(step.holds(Some(&json!("hello"))));
        assert!(!step.holds(Some(&json!("world"))));

        let step = filter(json!({"field": "f", "operator": "contains", "value": 3}));
        assert!(step.holds(Some(&json!([1, 2, 3]))));
    }

    #[test]
    fn test_exists_treats_null_as_missing() {
        let step = filter(json!({"field": "f", "operator": "exists"}));
        assert!(step.holds(Some(&json!(0))));
        assert!(!step.holds(Some(&Value::Null)));

        let step = filter(json!({"field": "f", "operator": "not_exists"}));
        assert!(step.holds(None));
    }

    #[test]
    fn test_config_validation() {
        assert!(FieldFilterStep::from_config(&json!({"field": "f"})).is_err());
        assert!(FieldFilterStep::from_config(&json!({"field": "Bad", "value": 1})).is_err());
        assert!(FieldFilterStep::from_config(&json!({"operator": "exists"})).is_err());
        assert!(
            FieldFilterStep::from_config(&json!({"field": "f", "operator": "exists"})).is_ok()
        );
    }
}
