//! eventide: cluster process
//!
//! Every instance consumes the blog, comment and user subscriptions inside
//! its service's consumer groups. The instance whose id matches
//! `leader_instance_id` (any instance in development) also provisions streams
//! and groups at boot and runs trimming, reclamation and consumer GC.
//!
//! ## Configuration
//! - First argument or EVENTIDE_CONFIG: YAML config file (optional)
//! - EVENTIDE__*: config overrides, e.g. EVENTIDE__REDIS__URL
//! - EVENTIDE_INSTANCE_ID / pm_id / NODE_APP_INSTANCE: instance id
//! - EVENTIDE_LOG, EVENTIDE_LOG_FORMAT: logging

use tracing::{error, info};

use eventide::config::Config;
use eventide::runtime::{Backends, Node};
use eventide::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path(std::env::args());
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;
    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    let instance = config.resolve_instance_id()?;
    info!(mode = ?config.mode, instance = %instance, "Starting eventide");

    let backends = Backends::connect(&config).await?;
    let mut node = Node::start(&config, instance, backends).await?;

    let fatal = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            None
        }
        signal = node.fatal_signal() => signal,
    };

    node.shutdown().await;

    match fatal {
        Some(signal) => {
            error!(
                service = %signal.service,
                subject = %signal.subject,
                error = %signal.error,
                "Exiting after unrecoverable connection loss"
            );
            Err(format!(
                "{} consumer on {} lost its connection: {}",
                signal.service, signal.subject, signal.error
            )
            .into())
        }
        None => Ok(()),
    }
}
