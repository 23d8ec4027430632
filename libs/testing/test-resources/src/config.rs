//! Lifecycle manager configuration
//!
//! Environment variables:
//! - `TEST_RESOURCES_STARTUP_TIMEOUT_SECS`: readiness window when a descriptor sets none (default 300)
//! - `TEST_RESOURCES_FETCH_TIMEOUT_SECS`: asset fetch window (default 600)
//! - `TEST_RESOURCES_POLL_INTERVAL_MS`: readiness poll cadence (default 500)
//! - `TEST_RESOURCES_CACHE_DIR`: host model cache mounted into services that use one

use std::path::PathBuf;
use std::time::Duration;

use core_config::{ConfigError, FromEnv, env_optional, env_parse};

pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceConfig {
    pub startup_timeout: Duration,
    pub fetch_timeout: Duration,
    pub poll_interval: Duration,
    pub cache_dir: Option<PathBuf>,
}

impl ResourceConfig {
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            cache_dir: None,
        }
    }
}

impl FromEnv for ResourceConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let startup_secs = env_parse(
            "TEST_RESOURCES_STARTUP_TIMEOUT_SECS",
            DEFAULT_STARTUP_TIMEOUT_SECS,
        )?;
        let fetch_secs = env_parse("TEST_RESOURCES_FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS)?;
        let poll_ms = env_parse("TEST_RESOURCES_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;

        if poll_ms == 0 {
            return Err(ConfigError::ParseError {
                key: "TEST_RESOURCES_POLL_INTERVAL_MS".to_string(),
                details: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            startup_timeout: Duration::from_secs(startup_secs),
            fetch_timeout: Duration::from_secs(fetch_secs),
            poll_interval: Duration::from_millis(poll_ms),
            cache_dir: env_optional("TEST_RESOURCES_CACHE_DIR").map(PathBuf::from),
        })
    }
}
