//! Workflow automation engine
//!
//! The engine module provides the `AutomationEngine`, which accepts events,
//! builds and processes the queue, replays history and applies retention.

mod executor;
mod intake;
mod pipeline;
mod processor;
mod queue_builder;
mod replay;
mod retention;

pub use executor::{AutomationEngine, EngineError};
pub use intake::SubmitReport;
pub use processor::ProcessReport;
pub use replay::{ConfigSource, ReplayReport};
pub use retention::CleanupReport;
