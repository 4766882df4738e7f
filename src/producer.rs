use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{HarnessConfig, Mode};
use crate::connection::SendHandle;
use crate::error::SendError;
use crate::message::TestMessage;

const QUIT: &str = "q";
const PROMPT: &str = "Enter message (or 'q' to quit): ";

/// Source of operator input for interactive mode
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator, `None` at end of input
    async fn next_line(&mut self) -> io::Result<Option<String>>;
}

/// Prompts on stdout and reads lines from stdin
pub struct StdinLines {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinLines {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinLines {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LineSource for StdinLines {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;
        self.lines.next_line().await
    }
}

/// Outcome of one producer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerReport {
    pub attempted: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Send one message, logging the attempt and its outcome
pub async fn send(endpoint: &SendHandle, message: &TestMessage) -> Result<(), SendError> {
    debug!("📤 Sending '{}' to {}", message.message(), endpoint.address());

    match endpoint.send(message).await {
        Ok(()) => {
            info!("✅ Sent: {}", message.message());
            Ok(())
        }
        Err(e) => {
            error!("❌ {} ({:?})", e, e.source);
            Err(e)
        }
    }
}

/// Drives test traffic into one send endpoint until input ends, the burst
/// completes, or a shutdown signal arrives.
pub struct ProducerLoop {
    endpoint: SendHandle,
    shutdown: broadcast::Receiver<()>,
    stopped: bool,
    report: ProducerReport,
}

impl ProducerLoop {
    pub fn new(endpoint: SendHandle, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            endpoint,
            shutdown,
            stopped: false,
            report: ProducerReport::default(),
        }
    }

    /// Run in the mode the harness is configured for
    pub async fn run<S: LineSource>(self, config: &HarnessConfig, source: S) -> ProducerReport {
        match config.mode {
            Mode::Burst => self.run_burst(config.burst_count, config.burst_delay()).await,
            Mode::Interactive => {
                self.run_interactive(source, config.interactive_delay())
                    .await
            }
        }
    }

    /// Send `Test message {i}` for every `i` in `0..count`, pausing `delay` after each
    pub async fn run_burst(mut self, count: u32, delay: Duration) -> ProducerReport {
        info!("🚀 Burst of {} messages to {}", count, self.endpoint.address());

        for i in 0..count {
            if self.stop_requested() {
                break;
            }
            self.attempt(TestMessage::new(format!("Test message {}", i)))
                .await;
            if self.pause(delay).await {
                break;
            }
        }

        self.finish()
    }

    /// Send each operator line until `q`, end of input, or shutdown
    pub async fn run_interactive<S: LineSource>(
        mut self,
        mut source: S,
        delay: Duration,
    ) -> ProducerReport {
        info!("🚀 Interactive producer on {}", self.endpoint.address());

        loop {
            if self.stop_requested() {
                break;
            }

            let line = tokio::select! {
                line = source.next_line() => line,
                _ = shutdown_signal(&mut self.shutdown) => {
                    self.stopped = true;
                    break;
                }
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!("❌ Failed to read input: {}", e);
                    break;
                }
            };

            if line == QUIT {
                info!("Quit requested");
                break;
            }
            if line.is_empty() {
                continue;
            }

            self.attempt(TestMessage::new(line)).await;
            if self.pause(delay).await {
                break;
            }
        }

        self.finish()
    }

    async fn attempt(&mut self, message: TestMessage) {
        self.report.attempted += 1;
        match send(&self.endpoint, &message).await {
            Ok(()) => self.report.sent += 1,
            Err(_) => self.report.failed += 1,
        }
    }

    /// Sleep for `delay`; true when a shutdown signal cut it short
    async fn pause(&mut self, delay: Duration) -> bool {
        if self.stopped {
            return true;
        }

        tokio::select! {
            _ = sleep(delay) => false,
            _ = shutdown_signal(&mut self.shutdown) => {
                self.stopped = true;
                true
            }
        }
    }

    fn stop_requested(&mut self) -> bool {
        if !self.stopped {
            match self.shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) => self.stopped = true,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
            }
        }
        self.stopped
    }

    fn finish(self) -> ProducerReport {
        if self.stopped {
            warn!("🛑 Producer stopped by shutdown signal");
        }
        let report = self.report;
        info!(
            "Producer finished: {} attempted, {} sent, {} failed",
            report.attempted, report.sent, report.failed
        );
        report
    }
}

/// Resolves once a shutdown signal arrives; never resolves if every sender is gone
async fn shutdown_signal(shutdown: &mut broadcast::Receiver<()>) {
    match shutdown.recv().await {
        Ok(()) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => std::future::pending::<()>().await,
    }
}
