// Queue scheduler
// Decision: One loop drives both intervals so a tick and a cleanup never overlap

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tripwire_engine::{AutomationEngine, AutomationStore, CleanupReport, ProcessReport};

use crate::config::WorkerConfig;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Entries created by the queue build
    pub queued: usize,
    /// `None` when processing failed before any entry ran
    pub processed: Option<ProcessReport>,
}

/// Drives the engine's queue and retention jobs on fixed intervals
pub struct Scheduler<S: AutomationStore> {
    engine: AutomationEngine<S>,
    tick_interval: Duration,
    cleanup_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: AutomationStore> Scheduler<S> {
    pub fn new(engine: AutomationEngine<S>, config: &WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            tick_interval: config.tick_interval,
            cleanup_interval: config.cleanup_interval,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn engine(&self) -> &AutomationEngine<S> {
        &self.engine
    }

    /// Build the queue, then process due entries
    ///
    /// A failed build is logged and processing still runs, so entries
    /// queued earlier are not held up.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let queued = match self.engine.build_queue(now).await {
            Ok(queued) => queued,
            Err(e) => {
                error!(error = %e, "queue build failed");
                0
            }
        };

        let processed = match self.engine.process_due(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "queue processing failed");
                None
            }
        };

        TickReport { queued, processed }
    }

    /// Run retention cleanup, logging failures
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Option<CleanupReport> {
        match self.engine.cleanup(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "retention cleanup failed");
                None
            }
        }
    }

    /// Run until [`shutdown`](Self::shutdown) is called
    ///
    /// A tick in progress when shutdown is requested runs to completion.
    pub async fn run(&self) -> Result<()> {
        info!(
            tick_secs = self.tick_interval.as_secs(),
            cleanup_secs = self.cleanup_interval.as_secs(),
            "Starting scheduler"
        );

        let mut shutdown = self.shutdown_rx.clone();
        let mut ticks = tokio::time::interval(self.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanups = tokio::time::interval(self.cleanup_interval);
        cleanups.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping scheduler");
                break;
            }

            tokio::select! {
                _ = ticks.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = cleanups.tick() => {
                    self.cleanup(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    info!("Shutdown while waiting for next tick");
                    break;
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Signal the scheduler to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
