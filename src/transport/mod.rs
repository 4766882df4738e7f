//! Broker transport seam.
//!
//! The harness core never speaks AMQP itself. It drives a [`Transport`] that
//! opens a [`TransportSession`], declares queues, feeds deliveries into a
//! channel and resolves [`SendEndpoint`]s. [`AmqpTransport`] talks to a real
//! broker through `lapin`; [`MemoryTransport`] is an in-process loopback used
//! for dry runs and tests.

mod amqp;
mod memory;

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::SessionSettings;
use crate::error::TransportError;
use crate::message::TestMessage;

pub use amqp::AmqpTransport;
pub use memory::{FaultPlan, MemoryTransport};

/// Queue durability policy, declared once for the whole bus
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Replicated across a quorum of cluster nodes (`x-queue-type=quorum`)
    #[default]
    Quorum,
    Classic,
}

impl QueuePolicy {
    pub fn queue_type(&self) -> &'static str {
        match self {
            QueuePolicy::Quorum => "quorum",
            QueuePolicy::Classic => "classic",
        }
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_type())
    }
}

/// Everything a transport needs to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTarget {
    /// Raw scheme prefix as configured, e.g. `amqp://`
    pub scheme: String,
    pub host: String,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
    /// Failover peers in attempt order
    pub peers: Vec<String>,
    pub queue_policy: QueuePolicy,
}

impl BusTarget {
    pub fn from_settings(settings: &SessionSettings, queue_policy: QueuePolicy) -> Self {
        Self {
            scheme: settings.uri.clone(),
            host: settings.host.clone(),
            virtual_host: settings.virtual_host.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            peers: settings.cluster.nodes().to_vec(),
            queue_policy,
        }
    }

    /// Logical bus address without credentials, e.g. `amqp://broker1/vh/`
    pub fn address(&self) -> String {
        format!("{}{}/{}/", self.scheme, self.host, self.virtual_host)
    }

    /// Primary host first, then each peer not already listed
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = vec![self.host.as_str()];
        for peer in &self.peers {
            if !nodes.contains(&peer.as_str()) {
                nodes.push(peer.as_str());
            }
        }
        nodes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub policy: QueuePolicy,
}

impl QueueSpec {
    /// Quorum queues must be durable; classic ones are declared durable too
    pub fn durable(name: &str, policy: QueuePolicy) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            policy,
        }
    }
}

/// How a delivery is settled with the broker once the consumer is done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Negative acknowledgement without requeue
    Reject,
}

#[async_trait]
pub trait Acker: Send {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), TransportError>;
}

/// Raw delivery handed from the transport to a receive endpoint
pub struct InboundDelivery {
    pub payload: Vec<u8>,
    pub acker: Box<dyn Acker>,
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Resolved, reusable capability for delivering to one queue
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SendEndpoint: Send + Sync {
    async fn send(&self, message: &TestMessage) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Node that accepted the connection
    fn node(&self) -> &str;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    /// Start consuming; deliveries arrive on the returned channel in broker order
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<InboundDelivery>, TransportError>;

    async fn resolve(&self, queue: &str) -> Result<Arc<dyn SendEndpoint>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, target: &BusTarget) -> Result<Box<dyn TransportSession>, TransportError>;
}
