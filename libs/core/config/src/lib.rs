pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Where the process runs (local workstation or a CI runner)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Local, // Developer machine, pretty logs
    Ci,    // CI runner, JSON logs
}

impl Environment {
    /// `APP_ENV=ci|local` wins; otherwise any non-empty `CI` other than "false" means CI.
    pub fn from_env() -> Self {
        if let Ok(app_env) = env::var("APP_ENV") {
            if app_env.eq_ignore_ascii_case("ci") {
                return Environment::Ci;
            }
            if app_env.eq_ignore_ascii_case("local") {
                return Environment::Local;
            }
        }

        match env::var("CI") {
            Ok(value) if !value.is_empty() && !value.eq_ignore_ascii_case("false") => {
                Environment::Ci
            }
            _ => Environment::Local,
        }
    }

    pub fn is_ci(&self) -> bool {
        matches!(self, Environment::Ci)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Environment::Local)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse an environment variable, falling back to `default` when unset
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to load an optional environment variable (unset or empty => None)
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
