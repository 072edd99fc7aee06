//! Scheduler configuration.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Tunables of one scheduler instance. Every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay before a failed message delivery is retried.
    pub rescheduling_delay_ms: u64,
    /// Period of the running job checker.
    pub job_check_interval_ms: u64,
    /// Resources kept alive by the store's identity cache.
    pub cache_capacity: usize,
    /// Attempts to take a lock record guard before giving up.
    pub lock_guard_retries: u32,
    /// Sleep between two guard attempts.
    pub lock_guard_backoff_ms: u64,
    /// Root of the file-backed collaborators; in-memory ones when absent.
    pub state_dir: Option<PathBuf>,
    /// Owner recorded on locks; generated when absent.
    pub owner: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rescheduling_delay_ms: 250,
            job_check_interval_ms: 5 * 60 * 1000,
            cache_capacity: 1024,
            lock_guard_retries: 20,
            lock_guard_backoff_ms: 5,
            state_dir: None,
            owner: None,
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, String>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| format!("{name}: {e}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(format!("{name}: {e}")),
    }
}

impl SchedulerConfig {
    /// Configuration with every default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the messenger retry delay.
    #[must_use]
    pub const fn with_rescheduling_delay_ms(mut self, delay: u64) -> Self {
        self.rescheduling_delay_ms = delay;
        self
    }

    /// Set the running job check period.
    #[must_use]
    pub const fn with_job_check_interval_ms(mut self, interval: u64) -> Self {
        self.job_check_interval_ms = interval;
        self
    }

    /// Set the identity cache capacity.
    #[must_use]
    pub const fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the lock guard retry policy.
    #[must_use]
    pub const fn with_lock_guard(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.lock_guard_retries = retries;
        self.lock_guard_backoff_ms = backoff_ms;
        self
    }

    /// Use file-backed collaborators under `dir`.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Fix the lock owner name.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Describes the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.rescheduling_delay_ms == 0 {
            return Err("rescheduling_delay_ms must be greater than 0".into());
        }
        if self.job_check_interval_ms == 0 {
            return Err("job_check_interval_ms must be greater than 0".into());
        }
        if self.cache_capacity == 0 {
            return Err("cache_capacity must be greater than 0".into());
        }
        if self.lock_guard_retries == 0 {
            return Err("lock_guard_retries must be greater than 0".into());
        }
        if self.owner.as_deref().is_some_and(|owner| owner.trim().is_empty() || owner.contains(char::is_whitespace)) {
            return Err("owner must be non-empty and contain no whitespace".into());
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `XPM_*` environment variables, after loading a
    /// `.env` file if one exists.
    ///
    /// # Errors
    ///
    /// Unparsable variable or validation failure.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is not an error.
        let _ = dotenvy::dotenv();
        let mut cfg = Self::default();
        if let Some(value) = env_value("XPM_RESCHEDULING_DELAY_MS")? {
            cfg.rescheduling_delay_ms = value;
        }
        if let Some(value) = env_value("XPM_JOB_CHECK_INTERVAL_MS")? {
            cfg.job_check_interval_ms = value;
        }
        if let Some(value) = env_value("XPM_CACHE_CAPACITY")? {
            cfg.cache_capacity = value;
        }
        if let Some(value) = env_value("XPM_LOCK_GUARD_RETRIES")? {
            cfg.lock_guard_retries = value;
        }
        if let Some(value) = env_value("XPM_LOCK_GUARD_BACKOFF_MS")? {
            cfg.lock_guard_backoff_ms = value;
        }
        if let Some(value) = env_value::<String>("XPM_STATE_DIR")? {
            cfg.state_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_value::<String>("XPM_OWNER")? {
            cfg.owner = Some(value);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
