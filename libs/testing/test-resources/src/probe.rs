//! Readiness probing
//!
//! Polls a started service until its readiness check passes or the startup
//! window closes. There is no retry after a timeout.

use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::descriptor::ReadinessCheck;
use crate::error::{ResourceError, ResourceResult};
use crate::instance::RunningInstance;

/// Single-attempt timeout for a connect or HTTP call
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client that keeps no idle connections
///
/// A pooled connection is bound to the tokio runtime that opened it, and the
/// shared manager is used from many short-lived test runtimes.
pub fn http_client() -> Client {
    Client::builder()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Blocks until `check` passes against `instance`
///
/// Fails with `StartupTimeout` once `timeout` has elapsed.
pub async fn wait_until_ready(
    client: &Client,
    instance: &RunningInstance,
    check: &ReadinessCheck,
    timeout: Duration,
    poll_interval: Duration,
) -> ResourceResult<()> {
    let port = instance.host_port(check.container_port()).ok_or_else(|| {
        ResourceError::Runtime(format!(
            "Readiness port {} of '{}' is not published",
            check.container_port(),
            instance.label
        ))
    })?;

    let started = Instant::now();
    let polling = async {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if probe_once(client, &instance.host, port, check).await {
                return attempts;
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(timeout, polling).await {
        Ok(attempts) => {
            info!(
                service = %instance.label,
                attempts,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Service ready"
            );
            Ok(())
        }
        Err(_) => Err(ResourceError::StartupTimeout {
            label: instance.label.clone(),
            timeout,
        }),
    }
}

/// One readiness attempt; any failure just means "not yet"
pub async fn probe_once(client: &Client, host: &str, port: u16, check: &ReadinessCheck) -> bool {
    match check {
        ReadinessCheck::PortListening { .. } => {
            match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect((host, port))).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    trace!(host, port, error = %e, "Port not listening yet");
                    false
                }
                Err(_) => false,
            }
        }
        ReadinessCheck::Http { path, status, .. } => {
            let url = format!("http://{}:{}{}", host, port, path);
            match client.get(&url).timeout(ATTEMPT_TIMEOUT).send().await {
                Ok(response) if response.status().as_u16() == *status => true,
                Ok(response) => {
                    debug!(%url, status = response.status().as_u16(), "Health check not passing yet");
                    false
                }
                Err(e) => {
                    trace!(%url, error = %e, "Health check unreachable");
                    false
                }
            }
        }
    }
}
