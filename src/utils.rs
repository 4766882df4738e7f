use anyhow::{anyhow, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const DEFAULT_LEVEL: &str = "info";
const MASK: &str = "********";

/// Pick the log filter: CLI override first, then `RUST_LOG`, then the config file
fn filter_directive(cli: Option<&str>, env: Option<&str>, configured: &str) -> String {
    [cli, env, Some(configured)]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|directive| !directive.is_empty())
        .unwrap_or(DEFAULT_LEVEL)
        .to_string()
}

/// Initialize tracing from the logging config
pub fn initialize_logging(config: &LoggingConfig, cli_level: Option<&str>) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(cli_level, env.as_deref(), &config.level);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{}' ({}), using '{}'", directive, e, DEFAULT_LEVEL);
        EnvFilter::new(DEFAULT_LEVEL)
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match config.output.to_ascii_lowercase().as_str() {
        "stderr" => builder.with_writer(std::io::stderr).try_init(),
        _ => builder.with_writer(std::io::stdout).try_init(),
    };

    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

/// Replace a secret with a fixed mask. Empty stays empty so a missing value is still visible.
pub fn mask_secret(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        MASK.to_string()
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C on Windows)
pub async fn setup_signal_handlers() {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("📡 Received SIGTERM - initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        info!("📡 Received SIGINT (Ctrl+C) - initiating graceful shutdown");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("⚠️ Failed to register Unix signal handlers: {}, falling back to Ctrl+C", e);
            }
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("📡 Received Ctrl+C - initiating graceful shutdown");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
            // Never resolve, otherwise the harness would stop immediately
            std::future::pending::<()>().await;
        }
    }
}
