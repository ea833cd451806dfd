//! Worker configuration loaded from `EVENTIDE_*` environment variables.
//!
//! Every setting except the database URL has a default. Values are parsed
//! strictly: a variable that is set but malformed is an error rather than
//! silently falling back.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `EVENTIDE_DATABASE_URL` | required |
//! | `EVENTIDE_DATABASE_MAX_CONNECTIONS` | 10 |
//! | `EVENTIDE_FILTER_PAGE_SIZE` | 500 |
//! | `EVENTIDE_STORAGE_MAX_RETRIES` | 3 |
//! | `EVENTIDE_STORAGE_INITIAL_DELAY_MS` | 100 |
//! | `EVENTIDE_STORAGE_MAX_DELAY_MS` | 5000 |
//! | `EVENTIDE_LEASE_TTL_MS` | 30000 |
//! | `EVENTIDE_LEASE_RENEW_FRACTION` | 0.5 |
//! | `EVENTIDE_PROJECTION_BATCH_SIZE` | 200 |
//! | `EVENTIDE_PROJECTION_POLL_INTERVAL_MS` | 1000 |
//! | `EVENTIDE_DECODE_FAILURE_POLICY` | `dead_letter` |
//! | `EVENTIDE_WORKER_ID` | `eventide-<pid>` |
//! | `EVENTIDE_COMMAND_MAX_CONFLICT_RETRIES` | 3 |

use crate::lease::LeaseConfig;
use crate::retry::RetryPolicy;
use eventide_core::projection::DecodeFailurePolicy;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Environment variable not set: {0}")]
    Missing(String),

    /// A variable is set but cannot be parsed.
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
        /// Parse failure.
        reason: String,
    },

    /// Values parse but do not make sense together.
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
    /// Rows fetched per page when filtering.
    pub page_size: u32,
}

impl DatabaseConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Validation("database url must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation("max_connections must be > 0".to_string()));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Validation("page_size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Projection runner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Events per batch.
    pub batch_size: usize,
    /// Pause after an empty batch or while another worker holds the lease.
    #[serde(with = "crate::retry::duration_ms")]
    pub poll_interval: Duration,
    /// What to do with events that fail to decode.
    pub decode_failure_policy: DecodeFailurePolicy,
    /// Identity of this worker in lock records.
    pub owner_id: String,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            poll_interval: Duration::from_secs(1),
            decode_failure_policy: DecodeFailurePolicy::default(),
            owner_id: format!("eventide-{}", std::process::id()),
        }
    }
}

impl ProjectionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("batch_size must be > 0".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation("poll_interval must be > 0".to_string()));
        }
        if self.owner_id.trim().is_empty() {
            return Err(ConfigError::Validation("owner_id must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Command executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Rebuild-and-retry attempts after a concurrency conflict.
    pub max_conflict_retries: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self { max_conflict_retries: 3 }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventideConfig {
    /// Database settings.
    pub database: DatabaseConfig,
    /// Retries for transient storage errors.
    pub storage_retry: RetryPolicy,
    /// Lease timing; its retry policy mirrors `storage_retry`.
    pub lease: LeaseConfig,
    /// Projection runner settings.
    pub projection: ProjectionConfig,
    /// Command executor settings.
    pub command: CommandConfig,
}

impl EventideConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the database URL is missing, a variable
    /// is malformed, or the result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`EventideConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let retry_defaults = RetryPolicy::default();
        let lease_defaults = LeaseConfig::default();
        let projection_defaults = ProjectionConfig::default();

        let storage_retry = RetryPolicy::builder()
            .max_retries(vars.parse_or("EVENTIDE_STORAGE_MAX_RETRIES", retry_defaults.max_retries)?)
            .initial_delay(vars.millis_or("EVENTIDE_STORAGE_INITIAL_DELAY_MS", retry_defaults.initial_delay)?)
            .max_delay(vars.millis_or("EVENTIDE_STORAGE_MAX_DELAY_MS", retry_defaults.max_delay)?)
            .build();

        let config = Self {
            database: DatabaseConfig {
                url: vars.required("EVENTIDE_DATABASE_URL")?,
                max_connections: vars.parse_or("EVENTIDE_DATABASE_MAX_CONNECTIONS", 10)?,
                page_size: vars.parse_or("EVENTIDE_FILTER_PAGE_SIZE", 500)?,
            },
            lease: LeaseConfig {
                ttl: vars.millis_or("EVENTIDE_LEASE_TTL_MS", lease_defaults.ttl)?,
                renew_fraction: vars.parse_or("EVENTIDE_LEASE_RENEW_FRACTION", lease_defaults.renew_fraction)?,
                retry: storage_retry.clone(),
            },
            storage_retry,
            projection: ProjectionConfig {
                batch_size: vars.parse_or("EVENTIDE_PROJECTION_BATCH_SIZE", projection_defaults.batch_size)?,
                poll_interval: vars
                    .millis_or("EVENTIDE_PROJECTION_POLL_INTERVAL_MS", projection_defaults.poll_interval)?,
                decode_failure_policy: vars
                    .parse_or("EVENTIDE_DECODE_FAILURE_POLICY", projection_defaults.decode_failure_policy)?,
                owner_id: vars.get("EVENTIDE_WORKER_ID").unwrap_or(projection_defaults.owner_id),
            },
            command: CommandConfig {
                max_conflict_retries: vars
                    .parse_or("EVENTIDE_COMMAND_MAX_CONFLICT_RETRIES", CommandConfig::default().max_conflict_retries)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.projection.validate()?;

        if self.lease.ttl.is_zero() {
            return Err(ConfigError::Validation("lease ttl must be > 0".to_string()));
        }
        if !(self.lease.renew_fraction > 0.0 && self.lease.renew_fraction < 1.0) {
            return Err(ConfigError::Validation("lease renew_fraction must be in (0, 1)".to_string()));
        }
        if self.storage_retry.initial_delay > self.storage_retry.max_delay {
            return Err(ConfigError::Validation(
                "storage initial_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &str) -> Result<String, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::Missing(name.to_string()))
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = self.get(name) else {
            return Ok(default);
        };
        raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
    }

    fn millis_or(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse_or(name, default_ms).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<EventideConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        EventideConfig::from_lookup(|name| map.get(name).cloned())
    }

    const URL: (&str, &str) = ("EVENTIDE_DATABASE_URL", "postgres://localhost/eventide");

    #[test]
    fn defaults_apply_when_only_url_is_set() {
        let config = load(&[URL]).unwrap();

        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.page_size, 500);
        assert_eq!(config.storage_retry, RetryPolicy::default());
        assert_eq!(config.lease.ttl, Duration::from_secs(30));
        assert_eq!(config.lease.retry, config.storage_retry);
        assert_eq!(config.projection.batch_size, 200);
        assert_eq!(config.projection.decode_failure_policy, DecodeFailurePolicy::DeadLetter);
        assert!(config.projection.owner_id.starts_with("eventide-"));
        assert_eq!(config.command.max_conflict_retries, 3);
    }

    #[test]
    fn missing_url_is_reported() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::Missing("EVENTIDE_DATABASE_URL".to_string()));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            URL,
            ("EVENTIDE_LEASE_TTL_MS", "1500"),
            ("EVENTIDE_LEASE_RENEW_FRACTION", "0.25"),
            ("EVENTIDE_STORAGE_MAX_RETRIES", "7"),
            ("EVENTIDE_DECODE_FAILURE_POLICY", "halt"),
            ("EVENTIDE_WORKER_ID", "worker-a"),
            ("EVENTIDE_PROJECTION_POLL_INTERVAL_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.lease.ttl, Duration::from_millis(1500));
        assert!((config.lease.renew_fraction - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.storage_retry.max_retries, 7);
        assert_eq!(config.lease.retry.max_retries, 7);
        assert_eq!(config.projection.decode_failure_policy, DecodeFailurePolicy::Halt);
        assert_eq!(config.projection.owner_id, "worker-a");
        assert_eq!(config.projection.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = load(&[URL, ("EVENTIDE_PROJECTION_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var, value, .. }
            if var == "EVENTIDE_PROJECTION_BATCH_SIZE" && value == "lots"));

        let err = load(&[URL, ("EVENTIDE_DECODE_FAILURE_POLICY", "retry")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn validation_rejects_nonsense() {
        assert!(matches!(
            load(&[URL, ("EVENTIDE_PROJECTION_BATCH_SIZE", "0")]).unwrap_err(),
            ConfigError::Validation(_)
        ));
        assert!(matches!(
            load(&[URL, ("EVENTIDE_LEASE_RENEW_FRACTION", "1.5")]).unwrap_err(),
            ConfigError::Validation(_)
        ));
        assert!(matches!(
            load(&[URL, ("EVENTIDE_LEASE_TTL_MS", "0")]).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = load(&[URL]).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        let back: EventideConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
