// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker configuration: TOML file loading, environment overrides, and
//! validation.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix recognized for environment-variable overrides, e.g.
/// `PROCUREMENT_SYNC__RETRIES_COUNT=5`.
pub const ENV_PREFIX: &str = "PROCUREMENT_SYNC__";

/// Default operating timezone when none is configured.
pub const DEFAULT_TIMEZONE: &str = "Europe/Kiev";

/// Errors raised while loading or validating a [`WorkerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// An environment override could not be parsed into the target type.
    #[error("invalid value for {key}: {value:?}")]
    InvalidOverride {
        /// Environment variable key, without the [`ENV_PREFIX`].
        key: String,
        /// Raw string value that failed to parse.
        value: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Worker settings, one set shared by every spawned worker task.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Seconds added to a client's `request_interval` per 429 response.
    pub client_inc_step_timeout: f64,
    /// Seconds subtracted from `request_interval` per successful fetch.
    pub client_dec_step_timeout: f64,
    /// Upper bound of `request_interval` before a cookie reset is forced.
    pub drop_threshold_client_cookies: f64,
    /// Idle sleep when a queue pop comes back empty.
    pub worker_sleep_secs: f64,
    /// Per-attempt backoff multiplier used by the retry policy.
    pub retry_default_timeout_secs: f64,
    /// Maximum retries before an item is dropped (429 exempt).
    pub retries_count: i64,
    /// Bounded wait applied to every queue pop.
    pub queue_timeout_secs: f64,
    /// Bulk buffer flush threshold, by document count.
    pub bulk_save_limit: usize,
    /// Bulk buffer flush threshold, by wall time since the window opened.
    pub bulk_save_interval_secs: f64,
    /// Plural resource kind, e.g. `"tenders"`.
    pub resource: String,
    /// Number of worker tasks to spawn.
    pub workers_count: usize,
    /// IANA timezone name used for timeshift logging.
    pub timezone: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            client_inc_step_timeout: 1.0,
            client_dec_step_timeout: 0.1,
            drop_threshold_client_cookies: 25.0,
            worker_sleep_secs: 5.0,
            retry_default_timeout_secs: 3.0,
            retries_count: 10,
            queue_timeout_secs: 3.0,
            bulk_save_limit: 80,
            bulk_save_interval_secs: 15.0,
            resource: "tenders".to_string(),
            workers_count: 1,
            timezone: DEFAULT_TIMEZONE.to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load from a TOML file, then apply any `PROCUREMENT_SYNC__*`
    /// environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let mut config: WorkerConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseError {
                reason: e.to_string(),
            })?;
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an arbitrary `(key, value)` iterator, e.g.
    /// `std::env::vars()`. Keys not carrying [`ENV_PREFIX`] are ignored.
    pub fn apply_env_overrides(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (key, value) in vars {
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let field = field.to_lowercase();
            self.apply_override(&field, &value)?;
        }
        Ok(())
    }

    fn apply_override(&mut self, field: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidOverride {
            key: field.to_string(),
            value: value.to_string(),
        };
        match field {
            "client_inc_step_timeout" => {
                self.client_inc_step_timeout = value.parse().map_err(|_| invalid())?
            }
            "client_dec_step_timeout" => {
                self.client_dec_step_timeout = value.parse().map_err(|_| invalid())?
            }
            "drop_threshold_client_cookies" => {
                self.drop_threshold_client_cookies = value.parse().map_err(|_| invalid())?
            }
            "worker_sleep_secs" => self.worker_sleep_secs = value.parse().map_err(|_| invalid())?,
            "retry_default_timeout_secs" => {
                self.retry_default_timeout_secs = value.parse().map_err(|_| invalid())?
            }
            "retries_count" => self.retries_count = value.parse().map_err(|_| invalid())?,
            "queue_timeout_secs" => {
                self.queue_timeout_secs = value.parse().map_err(|_| invalid())?
            }
            "bulk_save_limit" => self.bulk_save_limit = value.parse().map_err(|_| invalid())?,
            "bulk_save_interval_secs" => {
                self.bulk_save_interval_secs = value.parse().map_err(|_| invalid())?
            }
            "resource" => self.resource = value.to_string(),
            "workers_count" => self.workers_count = value.parse().map_err(|_| invalid())?,
            "timezone" => self.timezone = value.to_string(),
            _ => {}
        }
        Ok(())
    }

    /// Validate semantic constraints not expressible in the type system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();
        if self.resource.trim().is_empty() {
            reasons.push("resource must not be empty".to_string());
        }
        if self.workers_count == 0 {
            reasons.push("workers_count must be at least 1".to_string());
        }
        if self.retries_count < 0 {
            reasons.push("retries_count must not be negative".to_string());
        }
        if self.bulk_save_limit == 0 {
            reasons.push("bulk_save_limit must be at least 1".to_string());
        }
        if self.timezone.parse::<Tz>().is_err() {
            reasons.push(format!("timezone {:?} is not a recognized IANA name", self.timezone));
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons })
        }
    }

    /// Singular form of [`Self::resource`] (trailing `s` dropped), used as a
    /// document type tag.
    pub fn resource_singular(&self) -> String {
        self.resource
            .strip_suffix('s')
            .unwrap_or(&self.resource)
            .to_string()
    }

    /// Parsed timezone, falling back to [`DEFAULT_TIMEZONE`] if somehow
    /// invalid (validation should have already rejected that case).
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::Europe__Kiev)
    }

    /// [`Self::worker_sleep_secs`] as a [`Duration`].
    pub fn worker_sleep(&self) -> Duration {
        Duration::from_secs_f64(self.worker_sleep_secs.max(0.0))
    }

    /// [`Self::queue_timeout_secs`] as a [`Duration`].
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.queue_timeout_secs.max(0.0))
    }

    /// [`Self::bulk_save_interval_secs`] as a [`Duration`].
    pub fn bulk_save_interval(&self) -> Duration {
        Duration::from_secs_f64(self.bulk_save_interval_secs.max(0.0))
    }
}

/// Render the current process environment restricted to override keys, for
/// diagnostic logging at startup.
pub fn active_overrides(vars: impl IntoIterator<Item = (String, String)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|stripped| (stripped.to_lowercase(), v)))
        .collect()
}
