pub mod config;
pub mod scheduler;
pub mod telemetry;
pub mod workflows;

// Re-export main types
pub use config::WorkerConfig;
pub use scheduler::{Scheduler, TickReport};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use workflows::{load_workflows, parse_workflows};
