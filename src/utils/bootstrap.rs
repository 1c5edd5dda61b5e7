//! Bootstrap utilities for the eventide binary.

use std::future::Future;

use backon::Retryable;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LOG_ENV_VAR, LOG_FORMAT_ENV_VAR};
use crate::utils::retry::connection_backoff;

/// Initialize tracing with the EVENTIDE_LOG environment variable.
///
/// Defaults to "info" level if EVENTIDE_LOG is not set. Emits JSON lines
/// when EVENTIDE_LOG_FORMAT is `json`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV_VAR)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connect to a backend with exponential backoff retry.
///
/// # Arguments
/// * `backend` - Human-readable name for logging (e.g., "redis streams")
/// * `address` - The address being connected to
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or the last error once retries are exhausted.
pub async fn connect_with_retry<T, E, F, Fut>(backend: &str, address: &str, connect: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let result = connect
        .retry(connection_backoff())
        .notify(|e: &E, delay| {
            warn!(
                backend = %backend,
                address = %address,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Connection failed, retrying"
            );
        })
        .await;

    match &result {
        Ok(_) => info!(backend = %backend, address = %address, "Connected"),
        Err(e) => error!(backend = %backend, address = %address, error = %e, "Giving up connecting"),
    }
    result
}

/// Config file path from the first command-line argument, if any.
pub fn parse_config_path(mut args: impl Iterator<Item = String>) -> Option<String> {
    args.nth(1).filter(|arg| !arg.starts_with('-'))
}
