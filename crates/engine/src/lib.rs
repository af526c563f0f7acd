//! # Tripwire Engine
//!
//! An event-triggered workflow automation engine. Administrators bind chains
//! of steps to event names; every matching event runs the chain, either
//! inline at submission time or later through a persistent queue.
//!
//! ## Features
//!
//! - **Realtime and queued workflows**: realtime chains run at submission,
//!   falling back to the queue when a step errors
//! - **Bounded retries**: errored queue entries are retried up to a
//!   configured number of attempts
//! - **Debouncing**: bursts of matching events collapse into one execution
//! - **Replayable history**: every step result is recorded with a snapshot of
//!   the step's configuration and can be re-executed
//!
//! ## Architecture
//!
//! ```text
//!   submit(event)                   scheduler tick
//!        │                                │
//!        ▼                                ▼
//! ┌──────────────┐   errored    ┌────────────────────┐
//! │ Event intake │ ───────────▶ │ build_queue        │
//! │ (realtime)   │   entries    │ process_queue      │
//! └──────────────┘              └────────────────────┘
//!        │                                │
//!        └──────────┬─────────────────────┘
//!                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Step chain                            │
//! │  (one transaction per step, result map threaded through)    │
//! └─────────────────────────────────────────────────────────────┘
//!                   │
//!                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     AutomationStore                          │
//! │  (workflows, events, queue, runs, step results)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tripwire_engine::prelude::*;
//! use serde_json::json;
//!
//! let engine = AutomationEngine::new(InMemoryStore::new());
//! engine
//!     .create_workflow(
//!         NewWorkflow::new("welcome", "user_created").with_step(NewStepDefinition::new(
//!             StepKind::Action,
//!             "log_dump",
//!             json!({"template": "welcome {userid}"}),
//!         )),
//!     )
//!     .await?;
//!
//! let now = Utc::now();
//! engine.submit(NewEvent::new("user_created", now), now).await?;
//! engine.build_queue(now).await?;
//! engine.process_due(now).await?;
//! ```

pub mod config;
pub mod engine;
pub mod model;
pub mod persistence;
pub mod step;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{
        AutomationEngine, CleanupReport, ConfigSource, EngineError, ProcessReport, ReplayReport,
        SubmitReport,
    };
    pub use crate::model::{
        Event, EventContext, NewEvent, NewStepDefinition, NewWorkflow, QueueStatus, ResultMap,
        RunOutcome, StepKind, Workflow,
    };
    pub use crate::persistence::{
        AutomationStore, InMemoryStore, PostgresStore, StoreError, StoreTransaction,
    };
    pub use crate::step::{
        Step, StepContext, StepDescriptor, StepError, StepOutcome, StepRegistry, StepType,
    };
    pub use chrono::Utc;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{
    AutomationEngine, CleanupReport, ConfigSource, EngineError, ProcessReport, ReplayReport,
    SubmitReport,
};
pub use persistence::{
    AutomationStore, InMemoryStore, PostgresStore, StoreError, StoreTransaction,
};
pub use step::{Step, StepContext, StepError, StepOutcome, StepRegistry, StepType};
