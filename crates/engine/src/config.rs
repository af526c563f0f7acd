//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits and retention windows for the engine
///
/// Debounce windows and match fields are not here: they belong to each
/// debounce step's own configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per queue entry before it is no longer selected
    pub max_tries: u32,

    /// Queue entries selected per processing pass
    pub max_items: usize,

    /// Wall-clock budget of a processing pass, checked between entries
    #[serde(with = "duration_millis")]
    pub max_duration: Duration,

    /// Age after which events no ready entry references are deleted
    #[serde(with = "duration_millis")]
    pub event_retention: Duration,

    /// Age after which finished, cancelled and deferred entries are deleted
    #[serde(with = "duration_millis")]
    pub queue_retention: Duration,

    /// Age after which runs and their step results are deleted
    #[serde(with = "duration_millis")]
    pub history_retention: Duration,
}

const DAY: u64 = 24 * 60 * 60;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            max_items: 500,
            max_duration: Duration::from_secs(60),
            event_retention: Duration::from_secs(30 * DAY),
            queue_retention: Duration::from_secs(30 * DAY),
            history_retention: Duration::from_secs(90 * DAY),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    /// Load from `TRIPWIRE_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_tries: env_parse("TRIPWIRE_MAX_TRIES").unwrap_or(defaults.max_tries),
            max_items: env_parse("TRIPWIRE_MAX_ITEMS").unwrap_or(defaults.max_items),
            max_duration: env_parse("TRIPWIRE_MAX_DURATION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_duration),
            event_retention: env_parse::<u64>("TRIPWIRE_EVENT_RETENTION_DAYS")
                .map(|d| Duration::from_secs(d * DAY))
                .unwrap_or(defaults.event_retention),
            queue_retention: env_parse::<u64>("TRIPWIRE_QUEUE_RETENTION_DAYS")
                .map(|d| Duration::from_secs(d * DAY))
                .unwrap_or(defaults.queue_retention),
            history_retention: env_parse::<u64>("TRIPWIRE_HISTORY_RETENTION_DAYS")
                .map(|d| Duration::from_secs(d * DAY))
                .unwrap_or(defaults.history_retention),
        }
    }

    /// Set the maximum attempts per queue entry
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries.max(1);
        self
    }

    /// Set the maximum entries per processing pass
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    /// Set the processing pass budget
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Set the event retention
    pub fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }

    /// Set the terminal queue entry retention
    pub fn with_queue_retention(mut self, retention: Duration) -> Self {
        self.queue_retention = retention;
        self
    }

    /// Set the run history retention
    pub fn with_history_retention(mut self, retention: Duration) -> Self {
        self.history_retention = retention;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.max_items, 500);
        assert_eq!(config.max_duration, Duration::from_secs(60));
        assert_eq!(config.history_retention, Duration::from_secs(90 * DAY));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_max_tries(0)
            .with_max_items(10)
            .with_max_duration(Duration::from_millis(250));
        assert_eq!(config.max_tries, 1);
        assert_eq!(config.max_items, 10);
        assert_eq!(config.max_duration, Duration::from_millis(250));
    }

    #[test]
    fn test_serializes_durations_as_millis() {
        let config = EngineConfig::default().with_max_duration(Duration::from_secs(2));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["max_duration"], 2000);

        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
