use anyhow::{Context, Result};
use tripwire_engine::{AutomationEngine, AutomationStore, InMemoryStore, PostgresStore};
use tripwire_worker::{init_telemetry, load_workflows, Scheduler, TelemetryConfig, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG: Log filter (default: "tripwire_engine=info,tripwire_worker=info")
    // - LOG_LEVEL: Level for the tripwire crates when RUST_LOG is unset
    init_telemetry(&TelemetryConfig::from_env()).context("Failed to initialize logging")?;

    tracing::info!("tripwire-worker starting...");

    let config = WorkerConfig::from_env();
    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresStore::connect(&url)
                .await
                .context("Failed to connect to database")?;
            if config.run_migrations {
                store.migrate().await.context("Failed to run migrations")?;
                tracing::info!("Database migrations applied");
            }
            run(store, config).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (dev mode)");
            run(InMemoryStore::new(), config).await
        }
    }
}

async fn run<S: AutomationStore>(store: S, config: WorkerConfig) -> Result<()> {
    let engine = AutomationEngine::with_config(store, config.engine.clone());
    if let Some(path) = &config.workflows_file {
        load_workflows(&engine, path).await?;
    }

    tracing::info!(
        max_tries = config.engine.max_tries,
        max_items = config.engine.max_items,
        max_duration_secs = config.engine.max_duration.as_secs(),
        "Starting scheduler"
    );
    let scheduler = Scheduler::new(engine, &config);

    let run = scheduler.run();
    tokio::pin!(run);

    // Let a tick in progress finish before exiting
    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Scheduler error");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            scheduler.shutdown();
            run.await?;
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
