use amqp_quorum_tester::config::{Config, LoggingConfig, Mode};
use amqp_quorum_tester::connection::{ConnectionManager, SessionOptions};
use amqp_quorum_tester::consumer;
use amqp_quorum_tester::producer::{ProducerLoop, StdinLines};
use amqp_quorum_tester::transport::{AmqpTransport, MemoryTransport, Transport};
use amqp_quorum_tester::{initialize_logging, setup_signal_handlers};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Smoke test for a clustered AMQP broker: declares a quorum queue, sends test
/// messages to it and logs every message it receives back.
#[derive(Parser, Debug)]
#[command(name = "amqp-quorum-tester", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Producer mode, overrides `harness.mode`
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Burst size, overrides `harness.burst_count`
    #[arg(long)]
    count: Option<u32>,

    /// Use the in-process loopback broker instead of a real one
    #[arg(long)]
    dry_run: bool,

    /// Log filter, overrides RUST_LOG and `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let result = runtime.block_on(run(cli));

    // A pending stdin read holds a blocking thread until the next line arrives
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            let _ = initialize_logging(&LoggingConfig::default(), cli.log_level.as_deref());
            error!("❌ {}", e);
            return Err(e.into());
        }
    };

    if let Some(mode) = cli.mode {
        config.harness.mode = mode;
    }
    if let Some(count) = cli.count {
        config.harness.burst_count = count;
    }

    initialize_logging(&config.logging, cli.log_level.as_deref())?;
    info!(
        "🚀 amqp-quorum-tester {} ({:?} mode)",
        env!("CARGO_PKG_VERSION"),
        config.harness.mode
    );
    config.settings.echo();

    let transport: Arc<dyn Transport> = if cli.dry_run {
        info!("Dry run: using the in-process loopback broker");
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(AmqpTransport::new(config.retry.clone()))
    };

    let mut manager = ConnectionManager::new(
        transport,
        SessionOptions::from(&config.harness),
        consumer::log_received(),
    );

    let queue_address = match manager.connect(&config.settings).await {
        Ok(handle) => handle.queue_address(),
        Err(e) => {
            error!("❌ {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = manager.start().await {
        error!("❌ {}", e);
        manager.stop().await;
        return Err(e.into());
    }

    let endpoint = match manager.get_send_endpoint(&queue_address).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("❌ {}", e);
            manager.stop().await;
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signal_task = tokio::spawn(async move {
        setup_signal_handlers().await;
        let _ = shutdown_tx.send(());
    });

    let report = ProducerLoop::new(endpoint, shutdown_rx)
        .run(&config.harness, StdinLines::new())
        .await;
    signal_task.abort();

    manager.request_stop();
    manager.stop().await;

    info!(
        "🛑 Shutdown complete: {} attempted, {} sent, {} failed",
        report.attempted, report.sent, report.failed
    );
    Ok(())
}
