//! Error types for service lifecycle and asset provisioning
//!
//! Four kinds are part of the caller-facing contract and are never retried
//! by this crate:
//! - **StartupTimeout**: readiness not reached inside the window
//! - **InitializationFailure**: one-time post-start hook failed (instance stays registered)
//! - **Provisioning**: listing or fetching an asset failed (nothing is remembered)
//! - **PortConflict**: a fixed host port is held by another process
//!
//! The remaining variants carry plumbing failures from the runtime or HTTP layer.

use std::time::Duration;

use core_config::ConfigError;
use thiserror::Error;

use crate::descriptor::ServiceLabel;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Service '{label}' not ready after {}s", .timeout.as_secs())]
    StartupTimeout { label: ServiceLabel, timeout: Duration },

    #[error("Initialization of '{label}' failed in hook '{hook}': {message}")]
    InitializationFailure {
        label: ServiceLabel,
        hook: String,
        message: String,
    },

    #[error("Failed to provision asset '{asset}' ({}): {body}", provisioning_detail(.status, .exit_code))]
    Provisioning {
        asset: String,
        /// HTTP status of the failed call, when the backend speaks HTTP
        status: Option<u16>,
        /// Exit code of the failed command, when the backend is a CLI
        exit_code: Option<i64>,
        /// Response body or captured output
        body: String,
    },

    #[error("Host port {port} is already in use")]
    PortConflict {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Service '{0}' is not running")]
    NotRunning(ServiceLabel),

    #[error("No decoder accepted the listing: {}", .reasons.join("; "))]
    Decode { reasons: Vec<String> },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type ResourceResult<T> = Result<T, ResourceError>;

fn provisioning_detail(status: &Option<u16>, exit_code: &Option<i64>) -> String {
    match (*status, *exit_code) {
        (Some(status), _) => format!("status {}", status),
        (None, Some(code)) => format!("exit code {}", code),
        (None, None) => "no response".to_string(),
    }
}

impl ResourceError {
    /// Create a provisioning error from an HTTP response
    pub fn provisioning_http(asset: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        ResourceError::Provisioning {
            asset: asset.into(),
            status: Some(status),
            exit_code: None,
            body: body.into(),
        }
    }

    /// Create a provisioning error from a command result
    pub fn provisioning_exec(
        asset: impl Into<String>,
        exit_code: Option<i64>,
        output: impl Into<String>,
    ) -> Self {
        ResourceError::Provisioning {
            asset: asset.into(),
            status: None,
            exit_code,
            body: output.into(),
        }
    }

    /// Whether this error is one of the caller-facing contract kinds
    pub fn is_contract_error(&self) -> bool {
        matches!(
            self,
            ResourceError::StartupTimeout { .. }
                | ResourceError::InitializationFailure { .. }
                | ResourceError::Provisioning { .. }
                | ResourceError::PortConflict { .. }
        )
    }
}

impl From<reqwest::Error> for ResourceError {
    fn from(err: reqwest::Error) -> Self {
        ResourceError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ResourceError {
    fn from(err: serde_json::Error) -> Self {
        ResourceError::Decode {
            reasons: vec![format!("invalid JSON: {}", err)],
        }
    }
}

impl From<testcontainers::TestcontainersError> for ResourceError {
    fn from(err: testcontainers::TestcontainersError) -> Self {
        ResourceError::Runtime(err.to_string())
    }
}

impl From<ConfigError> for ResourceError {
    fn from(err: ConfigError) -> Self {
        ResourceError::Config(err.to_string())
    }
}
