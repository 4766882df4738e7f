use futures::future::{BoxFuture, FutureExt};
use serde::Deserialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DeliveryError, TransportError};
use crate::message::{TestMessage, MESSAGE_TYPE};
use crate::transport::{InboundDelivery, QueuePolicy, QueueSpec, Settlement, TransportSession};

/// Consumer callback invoked once per delivered message
pub type Callback =
    Arc<dyn Fn(TestMessage) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

/// What happens to a delivery whose consumer failed
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge regardless of the consumer outcome; failed deliveries are dropped
    #[default]
    Always,
    /// Reject failed deliveries without requeue so the broker can dead-letter them
    RejectOnFailure,
}

impl AckPolicy {
    pub fn settlement(&self, outcome: &Result<(), DeliveryError>) -> Settlement {
        match (self, outcome) {
            (_, Ok(())) => Settlement::Ack,
            (AckPolicy::Always, Err(_)) => Settlement::Ack,
            (AckPolicy::RejectOnFailure, Err(_)) => Settlement::Reject,
        }
    }
}

/// Declared receive endpoint: queue, bound message type, durability policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointBinding {
    pub queue_name: String,
    pub message_type: &'static str,
    pub policy: QueuePolicy,
    pub ack_policy: AckPolicy,
}

/// Delivery counters for one binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
}

struct Dispatcher {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// Live binding owned by the connection; dispatch runs once activated
pub struct BindingHandle {
    binding: EndpointBinding,
    callback: Callback,
    counters: Arc<Counters>,
    dispatcher: Option<Dispatcher>,
}

impl EndpointBinding {
    /// Declare the durable queue and register `consumer` for it.
    /// Nothing is dispatched until [`BindingHandle::activate`].
    pub async fn bind(
        session: &dyn TransportSession,
        queue_name: &str,
        policy: QueuePolicy,
        ack_policy: AckPolicy,
        consumer: Callback,
    ) -> Result<BindingHandle, TransportError> {
        session
            .declare_queue(&QueueSpec::durable(queue_name, policy))
            .await?;

        let binding = EndpointBinding {
            queue_name: queue_name.to_string(),
            message_type: MESSAGE_TYPE,
            policy,
            ack_policy,
        };
        info!(
            "📥 Bound {} queue '{}' to {} (ack policy {:?})",
            policy, queue_name, binding.message_type, ack_policy
        );

        Ok(BindingHandle {
            binding,
            callback: consumer,
            counters: Arc::new(Counters::default()),
            dispatcher: None,
        })
    }
}

impl BindingHandle {
    pub fn binding(&self) -> &EndpointBinding {
        &self.binding
    }

    pub fn is_active(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Start consuming and spawn the dispatch task. No-op when already active.
    pub async fn activate(
        &mut self,
        session: &dyn TransportSession,
        prefetch: u16,
    ) -> Result<(), TransportError> {
        if self.is_active() {
            debug!("Binding for '{}' already active", self.binding.queue_name);
            return Ok(());
        }

        let deliveries = session.consume(&self.binding.queue_name, prefetch).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(dispatch_loop(
            self.binding.clone(),
            deliveries,
            Arc::clone(&self.callback),
            Arc::clone(&self.counters),
            shutdown_rx,
        ));

        self.dispatcher = Some(Dispatcher { shutdown_tx, task });
        debug!("🚀 Dispatch started for '{}'", self.binding.queue_name);
        Ok(())
    }

    /// Stop dispatch and wait for the task to finish its current delivery
    pub async fn release(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.shutdown_tx.send(());

            if let Err(e) = dispatcher.task.await {
                if e.is_cancelled() {
                    debug!("Dispatch task for '{}' was cancelled", self.binding.queue_name);
                } else {
                    error!("❌ Dispatch task for '{}' failed: {}", self.binding.queue_name, e);
                }
            }
        }

        let stats = self.stats();
        info!(
            "🛑 Released binding '{}' ({} delivered, {} failed)",
            self.binding.queue_name, stats.delivered, stats.failed
        );
    }
}

async fn dispatch_loop(
    binding: EndpointBinding,
    mut deliveries: mpsc::UnboundedReceiver<InboundDelivery>,
    callback: Callback,
    counters: Arc<Counters>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("Shutdown signal received for '{}'", binding.queue_name);
                break;
            }
            next = deliveries.recv() => match next {
                Some(delivery) => dispatch_one(&binding, delivery, &callback, &counters).await,
                None => {
                    debug!("Delivery channel for '{}' closed", binding.queue_name);
                    break;
                }
            }
        }
    }
}

async fn dispatch_one(
    binding: &EndpointBinding,
    delivery: InboundDelivery,
    callback: &Callback,
    counters: &Counters,
) {
    let outcome = match TestMessage::decode(&delivery.payload) {
        Ok(message) => invoke(callback, message).await,
        Err(e) => Err(DeliveryError::from(e)),
    };

    match &outcome {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("❌ Delivery on '{}' failed: {} ({:?})", binding.queue_name, e, e);
        }
    }

    let settlement = binding.ack_policy.settlement(&outcome);
    match delivery.acker.settle(settlement).await {
        Ok(()) => trace!("Delivery settled with {:?}", settlement),
        Err(e) => warn!("⚠️ Failed to settle delivery on '{}': {}", binding.queue_name, e),
    }
}

/// Run the callback, turning a panic into a [`DeliveryError`]
async fn invoke(callback: &Callback, message: TestMessage) -> Result<(), DeliveryError> {
    let callback = Arc::clone(callback);
    match AssertUnwindSafe(async move { callback(message).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(DeliveryError::Panicked(panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
