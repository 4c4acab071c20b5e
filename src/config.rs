//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Database file, or `:memory:`.
    pub database_path: PathBuf,
    /// Prefix for every table the store creates.
    pub schema: String,
    /// Run the per-queue supervisor (timeouts, stats, retention).
    pub supervise: bool,
    /// Run the cron timekeeper.
    pub schedule: bool,
    /// How often the supervisor walks all queues.
    pub supervise_interval: Duration,
    /// Minimum spacing between monitor passes for one queue, across all nodes.
    pub monitor_interval: Duration,
    /// Minimum spacing between maintenance passes for one queue, across all nodes.
    pub maintenance_interval: Duration,
    /// How often the store/local clock skew is resampled.
    pub clock_monitor_interval: Duration,
    /// How often schedules are evaluated, across all nodes.
    pub cron_monitor_interval: Duration,
    /// Refresh period of the queue-config cache.
    pub queue_cache_interval: Duration,
    /// How often worker snapshots are published while workers exist.
    pub wip_interval: Duration,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/queuekeeper.db"),
            schema: "keeper".to_string(),
            supervise: true,
            schedule: true,
            supervise_interval: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(86_400), // 1 day
            clock_monitor_interval: Duration::from_secs(600), // 10 minutes
            cron_monitor_interval: Duration::from_secs(30),
            queue_cache_interval: Duration::from_secs(60),
            wip_interval: Duration::from_secs(2),
        }
    }
}

impl KeeperConfig {
    /// In-memory database with every background loop disabled (for tests).
    pub fn in_memory() -> Self {
        Self {
            database_path: PathBuf::from(":memory:"),
            supervise: false,
            schedule: false,
            ..Self::default()
        }
    }

    /// Load from `KEEPER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            database_path: std::env::var("KEEPER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            schema: std::env::var("KEEPER_SCHEMA").unwrap_or(defaults.schema),
            supervise: env_bool("KEEPER_SUPERVISE", defaults.supervise)?,
            schedule: env_bool("KEEPER_SCHEDULE", defaults.schedule)?,
            supervise_interval: env_secs(
                "KEEPER_SUPERVISE_INTERVAL_SECS",
                defaults.supervise_interval,
            )?,
            monitor_interval: env_secs("KEEPER_MONITOR_INTERVAL_SECS", defaults.monitor_interval)?,
            maintenance_interval: env_secs(
                "KEEPER_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            )?,
            clock_monitor_interval: env_secs(
                "KEEPER_CLOCK_MONITOR_INTERVAL_SECS",
                defaults.clock_monitor_interval,
            )?,
            cron_monitor_interval: env_secs(
                "KEEPER_CRON_MONITOR_INTERVAL_SECS",
                defaults.cron_monitor_interval,
            )?,
            queue_cache_interval: env_secs(
                "KEEPER_QUEUE_CACHE_INTERVAL_SECS",
                defaults.queue_cache_interval,
            )?,
            wip_interval: defaults.wip_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject intervals below one second.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("supervise_interval", self.supervise_interval),
            ("monitor_interval", self.monitor_interval),
            ("maintenance_interval", self.maintenance_interval),
            ("clock_monitor_interval", self.clock_monitor_interval),
            ("cron_monitor_interval", self.cron_monitor_interval),
            ("queue_cache_interval", self.queue_cache_interval),
        ];
        for (key, value) in intervals {
            if value < Duration::from_secs(1) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1 second".to_string(),
                });
            }
        }
        if self.wip_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "wip_interval".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{other}'"),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::ParseError(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        KeeperConfig::default().validate().unwrap();
        KeeperConfig::in_memory().validate().unwrap();
    }

    #[test]
    fn sub_second_interval_rejected() {
        let config = KeeperConfig {
            monitor_interval: Duration::from_millis(200),
            ..KeeperConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitor_interval"));
    }

    #[test]
    fn in_memory_disables_background_loops() {
        let config = KeeperConfig::in_memory();
        assert!(!config.supervise);
        assert!(!config.schedule);
        assert_eq!(config.database_path, PathBuf::from(":memory:"));
    }
}
