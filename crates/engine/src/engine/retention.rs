//! Retention cleanup

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument};

use crate::persistence::AutomationStore;

use super::executor::{AutomationEngine, EngineError};

/// Rows deleted by one cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub events: u64,
    pub queue_entries: u64,
    pub runs: u64,
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<S: AutomationStore> AutomationEngine<S> {
    /// Delete rows older than the configured retention windows
    ///
    /// Events go first so the terminal entries that referenced them become
    /// eligible in the same pass. Events still referenced by a ready entry
    /// are kept whatever their age, and terminal entries are kept as long as
    /// their event is: the queue builder would enqueue the event again.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport, EngineError> {
        let events = self
            .store
            .purge_events(cutoff(now, self.config.event_retention))
            .await?;
        let queue_entries = self
            .store
            .purge_queue_entries(cutoff(now, self.config.queue_retention))
            .await?;
        let runs = self
            .store
            .purge_runs(cutoff(now, self.config.history_retention))
            .await?;

        let report = CleanupReport {
            events,
            queue_entries,
            runs,
        };
        if report != CleanupReport::default() {
            info!(events, queue_entries, runs, "retention cleanup");
        }
        Ok(report)
    }
}
