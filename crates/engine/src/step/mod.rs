//! Step abstractions and built-in step types
//!
//! Steps are the units a workflow chains together. They:
//! - Receive the result map built by the previous steps plus the event
//! - Return a [`StepOutcome`] deciding whether the chain goes on
//! - Write to the store only through the transaction they are handed
//!
//! Step types are resolved by identifier through the [`StepRegistry`].

mod action;
mod context;
mod debounce;
mod definition;
mod filter;
mod lookup;
mod registry;
pub mod template;

use serde_json::Value;

use crate::model::{Event, ResultMap};

pub use action::{LogDumpConfig, LogDumpStep};
pub use context::{ActingAs, ExecutionMode, Impersonation, StepContext};
pub use debounce::{DebounceConfig, DebounceStep};
pub use definition::{Step, StepConfigError, StepDescriptor, StepError, StepOutcome, StepType};
pub use filter::{FailStep, FieldFilterConfig, FieldFilterStep, FilterOperator};
pub use lookup::{EventFieldsConfig, EventFieldsStep};
pub use registry::{is_valid_identifier, RegistryError, StepFactory, StepRegistry};

/// Resolve a field from the result map first, then from the event
pub fn lookup_field(results: &ResultMap, event: &Event, name: &str) -> Option<Value> {
    results.get(name).cloned().or_else(|| event.field(name))
}
