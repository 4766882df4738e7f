use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    Acker, BusTarget, InboundDelivery, QueueSpec, SendEndpoint, Settlement, Transport,
    TransportSession,
};
use crate::error::TransportError;
use crate::message::TestMessage;

/// Faults the loopback broker injects on purpose
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Nodes that refuse connections
    pub unreachable_nodes: Vec<String>,
    /// 1-based ordinals of publishes that fail
    pub failing_sends: Vec<u64>,
    /// Artificial latency for send endpoint resolution
    pub resolve_delay: Option<Duration>,
}

/// In-process loopback broker.
///
/// Queues live in memory; publishes go straight to the active consumer of
/// the target queue or wait in a backlog until one appears. Cloning shares
/// the same broker, which lets tests inspect what a session did.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

#[derive(Default)]
struct MemoryBroker {
    faults: FaultPlan,
    state: Mutex<BrokerState>,
    publishes: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    attempted_nodes: Vec<String>,
    queues: HashMap<String, QueueState>,
    settlements: Vec<Settlement>,
    published: Vec<TestMessage>,
}

struct QueueState {
    spec: QueueSpec,
    backlog: VecDeque<Vec<u8>>,
    consumer: Option<mpsc::UnboundedSender<InboundDelivery>>,
}

impl MemoryBroker {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(self: &Arc<Self>, queue: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.state();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;

        let undelivered = match entry.consumer.as_ref() {
            Some(consumer) => {
                let delivery = InboundDelivery {
                    payload,
                    acker: Box::new(MemoryAcker {
                        broker: Arc::clone(self),
                    }),
                };
                consumer
                    .send(delivery)
                    .err()
                    .map(|mpsc::error::SendError(returned)| returned.payload)
            }
            None => Some(payload),
        };

        if let Some(payload) = undelivered {
            // No live consumer; keep the message for the next one
            entry.consumer = None;
            entry.backlog.push_back(payload);
        }
        Ok(())
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            broker: Arc::new(MemoryBroker {
                faults,
                ..MemoryBroker::default()
            }),
        }
    }

    /// Nodes the transport tried to connect to, in attempt order
    pub fn attempted_nodes(&self) -> Vec<String> {
        self.broker.state().attempted_nodes.clone()
    }

    pub fn declared_queues(&self) -> Vec<QueueSpec> {
        let mut specs: Vec<QueueSpec> = self
            .broker
            .state()
            .queues
            .values()
            .map(|queue| queue.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.broker.state().settlements.clone()
    }

    /// Messages accepted by the broker, in publish order
    pub fn published(&self) -> Vec<TestMessage> {
        self.broker.state().published.clone()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.broker
            .state()
            .queues
            .get(queue)
            .map(|queue| queue.consumer.is_some())
            .unwrap_or(false)
    }

    /// Push a raw payload as if another client had published it
    pub fn inject(&self, queue: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.broker.deliver(queue, payload.to_vec())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, target: &BusTarget) -> Result<Box<dyn TransportSession>, TransportError> {
        let nodes = target.nodes();

        for node in &nodes {
            self.broker.state().attempted_nodes.push(node.to_string());

            if self
                .broker
                .faults
                .unreachable_nodes
                .iter()
                .any(|unreachable| unreachable == node)
            {
                warn!("⚠️ Loopback node {} refused the connection", node);
                continue;
            }

            info!("✅ Connected to loopback node {}", node);
            return Ok(Box::new(MemorySession {
                broker: Arc::clone(&self.broker),
                node: node.to_string(),
                closed: Arc::new(AtomicBool::new(false)),
            }));
        }

        Err(TransportError::Unreachable {
            sweeps: 1,
            nodes: nodes.join(","),
            last: "connection refused".to_string(),
        })
    }
}

struct MemorySession {
    broker: Arc<MemoryBroker>,
    node: String,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn node(&self) -> &str {
        &self.node
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                spec: spec.clone(),
                backlog: VecDeque::new(),
                consumer: None,
            });
        debug!("Declared loopback {} queue '{}'", spec.policy, spec.name);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _prefetch: u16,
    ) -> Result<mpsc::UnboundedReceiver<InboundDelivery>, TransportError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let backlog: Vec<Vec<u8>> = {
            let mut state = self.broker.state();
            let entry = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue(queue.to_string()))?;
            entry.consumer = Some(tx.clone());
            entry.backlog.drain(..).collect()
        };

        for payload in backlog {
            let delivery = InboundDelivery {
                payload,
                acker: Box::new(MemoryAcker {
                    broker: Arc::clone(&self.broker),
                }),
            };
            // Receiver is still in hand, this cannot fail
            let _ = tx.send(delivery);
        }

        Ok(rx)
    }

    async fn resolve(&self, queue: &str) -> Result<Arc<dyn SendEndpoint>, TransportError> {
        if let Some(delay) = self.broker.faults.resolve_delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_open()?;

        if !self.broker.state().queues.contains_key(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }

        Ok(Arc::new(MemorySendEndpoint {
            broker: Arc::clone(&self.broker),
            queue: queue.to_string(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the senders ends every receive channel
        let mut state = self.broker.state();
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        debug!("Loopback session on {} closed", self.node);
        Ok(())
    }
}

struct MemorySendEndpoint {
    broker: Arc<MemoryBroker>,
    queue: String,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SendEndpoint for MemorySendEndpoint {
    async fn send(&self, message: &TestMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let ordinal = self.broker.publishes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.broker.faults.failing_sends.contains(&ordinal) {
            return Err(TransportError::Simulated(format!("publish #{} dropped", ordinal)));
        }

        let payload = message.encode()?;
        self.broker.deliver(&self.queue, payload)?;
        self.broker.state().published.push(message.clone());
        Ok(())
    }
}

struct MemoryAcker {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), TransportError> {
        self.broker.state().settlements.push(settlement);
        Ok(())
    }
}
