//! Persistence layer
//!
//! This module provides:
//! - [`AutomationStore`] trait for workflows, events, queue and history
//! - [`StoreTransaction`] scoped write handle used for every step execution
//! - [`InMemoryStore`] for tests and local development
//! - [`PostgresStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{AutomationStore, InsertedEvent, StoreError, StoreTransaction};
