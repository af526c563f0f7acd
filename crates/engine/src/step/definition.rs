//! Step trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StepContext;
use crate::model::{Event, ResultMap, StepKind};
use crate::persistence::{StoreError, StoreTransaction};

/// A transient step failure
///
/// Returned as `Err` from [`Step::execute`]. The engine rolls back the step's
/// transaction and retries the queue entry later, up to the configured
/// maximum number of tries. A *logical* failure is not an error: it is
/// [`StepOutcome::Halt`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StepError {}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        Self::new(err.to_string()).with_type("store")
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_type("serialization")
    }
}

/// What a step decided
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Success; the chain moves on with this result map
    Continue(ResultMap),

    /// Logical failure; the chain stops and the entry is finished early
    Halt(ResultMap),

    /// Execution moved to a future queue entry; this one is deferred
    Defer(ResultMap),

    /// Another entry won the debounce; this one is cancelled
    Superseded(ResultMap),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Continue(_))
    }

    /// Whether the step's result map is written to run history
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Continue(_) | Self::Defer(_))
    }

    pub fn results(&self) -> &ResultMap {
        match self {
            Self::Continue(r) | Self::Halt(r) | Self::Defer(r) | Self::Superseded(r) => r,
        }
    }

    pub fn into_results(self) -> ResultMap {
        match self {
            Self::Continue(r) | Self::Halt(r) | Self::Defer(r) | Self::Superseded(r) => r,
        }
    }
}

/// One unit of work in a workflow
///
/// A step receives the result map accumulated by the steps before it and
/// returns an updated one. Everything a step writes through `tx` is committed
/// only when the step returns `Ok`.
///
/// # Example
///
/// ```ignore
/// struct AlwaysContinue;
///
/// #[async_trait]
/// impl Step for AlwaysContinue {
///     async fn execute(
///         &self,
///         _ctx: &StepContext<'_>,
///         _tx: &mut dyn StoreTransaction,
///         _event: &Event,
///         results: ResultMap,
///     ) -> Result<StepOutcome, StepError> {
///         Ok(StepOutcome::Continue(results))
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(
        &self,
        ctx: &StepContext<'_>,
        tx: &mut dyn StoreTransaction,
        event: &Event,
        results: ResultMap,
    ) -> Result<StepOutcome, StepError>;
}

/// Static description of a step type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDescriptor {
    /// Registry key; lowercase letters, digits and underscores
    pub type_id: &'static str,
    pub kind: StepKind,
    pub name: &'static str,
    pub description: &'static str,

    /// Result map keys this step may add
    pub output_fields: &'static [&'static str],
}

/// Invalid step configuration
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct StepConfigError(pub String);

impl From<serde_json::Error> for StepConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// A step type that can be registered and built from configuration
pub trait StepType: Step + Sized + 'static {
    const DESCRIPTOR: StepDescriptor;

    /// Build an instance from the step's stored configuration
    fn from_config(config: &Value) -> Result<Self, StepConfigError>;
}
