// Worker configuration
// Decision: No DATABASE_URL means in-memory dev mode, not a startup error

use std::path::PathBuf;
use std::time::Duration;

use tripwire_engine::EngineConfig;

/// Configuration for the worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; `None` runs against an in-memory store
    pub database_url: Option<String>,
    /// Interval between queue build + process ticks
    pub tick_interval: Duration,
    /// Interval between retention cleanups
    pub cleanup_interval: Duration,
    /// Apply bundled migrations at startup
    pub run_migrations: bool,
    /// JSON array of workflows created at startup
    pub workflows_file: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            tick_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            run_migrations: true,
            workflows_file: None,
            engine: EngineConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let tick_interval = std::env::var("TRIPWIRE_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.tick_interval);

        let cleanup_interval = std::env::var("TRIPWIRE_CLEANUP_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.cleanup_interval);

        let run_migrations = std::env::var("TRIPWIRE_RUN_MIGRATIONS")
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.run_migrations);

        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            tick_interval,
            cleanup_interval,
            run_migrations,
            workflows_file: std::env::var("TRIPWIRE_WORKFLOWS_FILE").ok().map(PathBuf::from),
            engine: EngineConfig::from_env(),
        }
    }

    /// Set the tick interval; zero is raised to one second
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_secs(1));
        self
    }

    /// Set the cleanup interval; zero is raised to one second
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval.max(Duration::from_secs(1));
        self
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert!(config.run_migrations);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(" OFF "));
    }

    #[test]
    fn test_intervals_never_zero() {
        let config = WorkerConfig::default()
            .with_tick_interval(Duration::ZERO)
            .with_cleanup_interval(Duration::from_secs(5));
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.cleanup_interval, Duration::from_secs(5));
    }
}
