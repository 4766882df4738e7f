use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionState;

/// Missing or malformed settings. Always fatal, reported before any connection attempt.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Missing required setting '{0}'")]
    Missing(String),
    #[error("Required setting '{0}' is empty")]
    Empty(String),
    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Failures raised by a broker transport implementation
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("Invalid broker URI scheme '{0}' (expected amqp:// or amqps://)")]
    InvalidScheme(String),
    #[error("No cluster node reachable after {sweeps} sweep(s) over [{nodes}]: {last}")]
    Unreachable {
        sweeps: u32,
        nodes: String,
        last: String,
    },
    #[error("Message rejected by broker for queue '{0}'")]
    Rejected(String),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Queue '{0}' does not exist")]
    UnknownQueue(String),
    #[error("Session closed")]
    Closed,
    #[error("Simulated transport failure: {0}")]
    Simulated(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Cannot connect while connection is {0}")]
    InvalidState(ConnectionState),
    #[error("Failed to connect to {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Cannot start while connection is {0}")]
    InvalidState(ConnectionState),
    #[error("Failed to activate receive endpoint: {0}")]
    Transport(#[from] TransportError),
}

/// Send endpoint resolution failures. Surfaced to the caller, never retried.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Connection is ready but not started")]
    NotStarted,
    #[error("Send endpoints are unavailable while connection is {0}")]
    Unavailable(ConnectionState),
    #[error("Invalid send address '{address}': {reason}")]
    Invalid { address: String, reason: String },
    #[error("Timed out after {timeout:?} resolving send address '{address}'")]
    Timeout { address: String, timeout: Duration },
    #[error("Failed to resolve send address '{address}': {source}")]
    Transport {
        address: String,
        #[source]
        source: TransportError,
    },
}

/// A single send failed. Recoverable: the producer logs it and moves on.
#[derive(Debug, Error)]
#[error("Failed to send '{payload}' to {address}: {source}")]
pub struct SendError {
    pub address: String,
    pub payload: String,
    #[source]
    pub source: TransportError,
}

/// A consumer callback failed for one delivery. Recoverable.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Undecodable delivery payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Consumer failed: {0}")]
    Handler(String),
    #[error("Consumer panicked: {0}")]
    Panicked(String),
}
