// Public API
pub mod binding;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod producer;
pub mod transport;

// Internal modules
mod cluster;
mod utils;

pub use cluster::ClusterAddress;
pub use utils::{initialize_logging, setup_signal_handlers};

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
