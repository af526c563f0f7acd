//! Queue builder

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::persistence::AutomationStore;

use super::executor::{AutomationEngine, EngineError};

impl<S: AutomationStore> AutomationEngine<S> {
    /// Queue stored events for the active, non-realtime workflows that
    /// subscribe to them
    ///
    /// Each (workflow, event) pair is queued at most once, however often
    /// this runs. Returns the number of entries created.
    #[instrument(skip(self))]
    pub async fn build_queue(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let created = self.store.enqueue_unqueued_events(now).await?;
        if created.is_empty() {
            debug!("no events to queue");
        } else {
            info!(entries = created.len(), "queued events");
        }
        Ok(created.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewEvent, NewWorkflow};
    use crate::persistence::InMemoryStore;

    #[tokio::test]
    async fn test_build_queue_is_idempotent() {
        let store = InMemoryStore::new();
        let engine = AutomationEngine::new(store.clone());
        engine
            .create_workflow(NewWorkflow::new("a", "course_viewed"))
            .await
            .unwrap();
        engine
            .create_workflow(NewWorkflow::new("b", "course_viewed"))
            .await
            .unwrap();
        engine
            .create_workflow(NewWorkflow::new("off", "course_viewed").disabled())
            .await
            .unwrap();

        let now = Utc::now();
        for _ in 0..2 {
            engine
                .submit(NewEvent::new("course_viewed", now), now)
                .await
                .unwrap();
        }

        assert_eq!(engine.build_queue(now).await.unwrap(), 4);
        assert_eq!(engine.build_queue(now).await.unwrap(), 0);
        assert_eq!(store.queue_len(), 4);
    }
}
