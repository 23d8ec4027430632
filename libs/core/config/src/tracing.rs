use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in main() before any fallible operations. Safe to call
/// multiple times.
///
/// Configuration:
/// - Shows file:line where errors occur
/// - Hides environment variables (container credentials live there)
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize tracing with environment-aware configuration and error span capture.
///
/// - **CI** (`CI=true` or `APP_ENV=ci`):
///   - JSON format so runner logs can be grepped per container/asset
///   - Hides module targets
///
/// - **Local** (default):
///   - Pretty-printed format
///   - Container startup and model pulls at `info`, everything ours at `debug`
///
/// Both include `ErrorLayer` so `eyre` reports carry span traces.
///
/// Logs go to stderr; stdout is left to the program.
/// `RUST_LOG` overrides the default filter (e.g. `test_resources=trace`).
///
/// # Multiple Calls
///
/// Safe to call from every test: if a subscriber is already installed the
/// call is a no-op.
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if environment.is_ci() {
            EnvFilter::new("info,testcontainers=warn")
        } else {
            EnvFilter::new("info,test_resources=debug,testbed=debug,testcontainers=info")
        }
    });

    let result = if environment.is_ci() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => {
            info!(?environment, "Tracing initialized");
        }
        Err(_) => {
            debug!("Tracing already initialized, skipping re-initialization");
        }
    }
}
