use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::binding::{AckPolicy, BindingHandle, Callback, EndpointBinding};
use crate::config::{ConfigSnapshot, HarnessConfig};
use crate::error::{AddressError, ConnectError, SendError, StartError};
use crate::message::TestMessage;
use crate::transport::{BusTarget, QueuePolicy, SendEndpoint, Transport, TransportSession};

/// Lifecycle of the single logical bus connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Stopping,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Ready => "Ready",
            ConnectionState::Stopping => "Stopping",
            ConnectionState::Closed => "Closed",
            ConnectionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Session knobs fixed before connecting
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub resolve_timeout: Duration,
    pub prefetch: u16,
    pub ack_policy: AckPolicy,
    pub queue_policy: QueuePolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for SessionOptions {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            resolve_timeout: config.resolve_timeout(),
            prefetch: config.prefetch,
            ack_policy: config.ack_policy,
            queue_policy: config.queue_policy,
        }
    }
}

/// The live session. Owned by [`ConnectionManager`] and never handed out by value.
pub struct ConnectionHandle {
    target: BusTarget,
    session: Box<dyn TransportSession>,
    binding: BindingHandle,
    started: bool,
}

impl ConnectionHandle {
    /// Bus address, e.g. `amqp://broker1/vh/`
    pub fn address(&self) -> String {
        self.target.address()
    }

    /// Address of the bound receive queue, e.g. `amqp://broker1/vh/q1`
    pub fn queue_address(&self) -> String {
        format!("{}{}", self.address(), self.binding.binding().queue_name)
    }

    pub fn username(&self) -> &str {
        &self.target.username
    }

    /// Failover peers in attempt order
    pub fn peers(&self) -> &[String] {
        &self.target.peers
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        self.target.queue_policy
    }

    /// Node that accepted the connection
    pub fn node(&self) -> &str {
        self.session.node()
    }

    pub fn binding(&self) -> &EndpointBinding {
        self.binding.binding()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

/// Cloneable send capability for one resolved queue address
#[derive(Clone)]
pub struct SendHandle {
    address: String,
    endpoint: Arc<dyn SendEndpoint>,
}

impl SendHandle {
    pub fn new(address: impl Into<String>, endpoint: Arc<dyn SendEndpoint>) -> Self {
        Self {
            address: address.into(),
            endpoint,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn send(&self, message: &TestMessage) -> Result<(), SendError> {
        self.endpoint
            .send(message)
            .await
            .map_err(|source| SendError {
                address: self.address.clone(),
                payload: message.message().to_string(),
                source,
            })
    }
}

impl fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendHandle")
            .field("address", &self.address)
            .finish()
    }
}

/// Owns the bus connection lifecycle:
/// `Idle → Connecting → Ready → Stopping → Closed`, with `Failed` reachable
/// from `Connecting` and `Ready`. Every transition is logged and recorded.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    consumer: Callback,
    state: ConnectionState,
    history: Vec<ConnectionState>,
    handle: Option<ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions, consumer: Callback) -> Self {
        Self {
            transport,
            options,
            consumer,
            state: ConnectionState::Idle,
            history: vec![ConnectionState::Idle],
            handle: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Every state visited so far, starting with `Idle`
    pub fn history(&self) -> &[ConnectionState] {
        &self.history
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    fn transition(&mut self, next: ConnectionState) {
        info!("🔀 Connection {} → {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    fn fail(&mut self, cause: &dyn fmt::Display) {
        error!("❌ Connection failed in state {}: {}", self.state, cause);
        self.transition(ConnectionState::Failed);
    }

    /// Validate settings, open the session and declare the receive endpoint.
    ///
    /// A configuration problem is reported without leaving `Idle`; a transport
    /// problem moves the connection to `Failed`.
    pub async fn connect(
        &mut self,
        config: &ConfigSnapshot,
    ) -> Result<&ConnectionHandle, ConnectError> {
        if self.state != ConnectionState::Idle {
            return Err(ConnectError::InvalidState(self.state));
        }

        let settings = config.validate()?;
        let target = BusTarget::from_settings(&settings, self.options.queue_policy);
        let address = target.address();

        info!("🔗 Bus address {} (user {})", address, target.username);
        if target.peers.is_empty() {
            info!("Single-node mode, no failover peers");
        } else {
            for (index, peer) in target.peers.iter().enumerate() {
                info!("Registered failover peer #{}: {}", index + 1, peer);
            }
        }
        info!("Queue policy for the bus: {}", target.queue_policy);

        self.transition(ConnectionState::Connecting);

        let session = match self.transport.open(&target).await {
            Ok(session) => session,
            Err(e) => {
                self.fail(&e);
                return Err(ConnectError::Transport { address, source: e });
            }
        };

        let binding = match EndpointBinding::bind(
            session.as_ref(),
            &settings.queue_name,
            target.queue_policy,
            self.options.ack_policy,
            Arc::clone(&self.consumer),
        )
        .await
        {
            Ok(binding) => binding,
            Err(e) => {
                if let Err(close_error) = session.close().await {
                    warn!("⚠️ Failed to close session after bind error: {}", close_error);
                }
                self.fail(&e);
                return Err(ConnectError::Transport { address, source: e });
            }
        };

        info!("✅ Connected to {} via node {}", address, session.node());
        self.transition(ConnectionState::Ready);

        Ok(self.handle.insert(ConnectionHandle {
            target,
            session,
            binding,
            started: false,
        }))
    }

    /// Begin consumer dispatch and allow send endpoint resolution. Idempotent in `Ready`.
    pub async fn start(&mut self) -> Result<(), StartError> {
        if self.state != ConnectionState::Ready {
            error!("❌ start() called while connection is {}", self.state);
            return Err(StartError::InvalidState(self.state));
        }

        let prefetch = self.options.prefetch;
        let handle = match self.handle.as_mut() {
            Some(handle) => handle,
            None => return Err(StartError::InvalidState(self.state)),
        };

        if handle.started {
            debug!("Connection already started");
            return Ok(());
        }

        let result = handle
            .binding
            .activate(handle.session.as_ref(), prefetch)
            .await;

        match result {
            Ok(()) => {
                handle.started = true;
                info!(
                    "▶️ Connection started, dispatching '{}'",
                    handle.binding.binding().queue_name
                );
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(StartError::Transport(e))
            }
        }
    }

    /// Resolve a queue address on this bus into a reusable [`SendHandle`].
    ///
    /// Bounded by the resolve timeout; failures are returned, never retried.
    pub async fn get_send_endpoint(&self, address: &str) -> Result<SendHandle, AddressError> {
        let handle = match (&self.handle, self.state) {
            (Some(handle), ConnectionState::Ready) if handle.started => handle,
            (Some(_), ConnectionState::Ready) => return Err(AddressError::NotStarted),
            (_, state) => return Err(AddressError::Unavailable(state)),
        };

        let queue = queue_from_address(&handle.address(), address)?;
        let resolve_timeout = self.options.resolve_timeout;

        let endpoint = match timeout(resolve_timeout, handle.session.resolve(&queue)).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(source)) => {
                error!("❌ Failed to resolve {}: {}", address, source);
                return Err(AddressError::Transport {
                    address: address.to_string(),
                    source,
                });
            }
            Err(_) => {
                error!("❌ Resolving {} timed out after {:?}", address, resolve_timeout);
                return Err(AddressError::Timeout {
                    address: address.to_string(),
                    timeout: resolve_timeout,
                });
            }
        };

        info!("📮 Send endpoint ready: {}", address);
        Ok(SendHandle::new(address, endpoint))
    }

    /// Mark the connection as winding down. New send endpoints are refused;
    /// sends already holding a [`SendHandle`] may still settle.
    pub fn request_stop(&mut self) {
        if self.state == ConnectionState::Ready {
            self.transition(ConnectionState::Stopping);
        }
    }

    /// Release the binding and close every cluster link. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        match self.state {
            ConnectionState::Ready | ConnectionState::Stopping => {
                self.release().await;
                self.transition(ConnectionState::Closed);
            }
            ConnectionState::Failed => {
                // Terminal, but a failed start may still hold a session
                self.release().await;
            }
            other => debug!("stop() ignored while connection is {}", other),
        }
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.binding.release().await;
            match handle.session.close().await {
                Ok(()) => debug!("Session on {} closed", handle.session.node()),
                Err(e) => warn!("⚠️ Error while closing session: {}", e),
            }
        }
    }
}

/// Extract the queue name from `address`, which must live under `bus_address`
fn queue_from_address(bus_address: &str, address: &str) -> Result<String, AddressError> {
    let invalid = |reason: &str| AddressError::Invalid {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let queue = address
        .strip_prefix(bus_address)
        .ok_or_else(|| invalid(&format!("not under bus address {}", bus_address)))?;

    // Everything after the bus address is the queue name, slashes included
    if queue.is_empty() {
        return Err(invalid("missing queue name"));
    }

    Ok(queue.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{handler, log_received};
    use crate::error::{ConfigError, DeliveryError, TransportError};
    use crate::transport::{FaultPlan, MemoryTransport, MockSendEndpoint, QueueSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    use ConnectionState::*;

    fn scenario_config() -> ConfigSnapshot {
        ConfigSnapshot::from_pairs([
            ("uri", "amqp://"),
            ("host", "broker1"),
            ("virtualHost", "vh"),
            ("username", "guest"),
            ("password", "guest"),
            ("clusterNames", "n1,n2"),
            ("queueName", "q1"),
        ])
    }

    fn manager_with(transport: &MemoryTransport, consumer: Callback) -> ConnectionManager {
        ConnectionManager::new(
            Arc::new(transport.clone()),
            SessionOptions::default(),
            consumer,
        )
    }

    fn counting_callback() -> (Callback, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback = handler(move |_message: TestMessage| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), DeliveryError>(())
            }
        });
        (callback, calls)
    }

    #[tokio::test]
    async fn test_scenario_connect_start_send_receive() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logger = log_received();
        let consumer = handler(move |message: TestMessage| {
            let logger = Arc::clone(&logger);
            let tx = tx.clone();
            async move {
                let text = message.message().to_string();
                logger(message).await?;
                let _ = tx.send(text);
                Ok(())
            }
        });
        let mut manager = manager_with(&transport, consumer);

        let handle = manager.connect(&scenario_config()).await.unwrap();
        assert_eq!(handle.address(), "amqp://broker1/vh/");
        assert_eq!(handle.peers(), &["n1", "n2"]);
        assert_eq!(handle.queue_policy(), QueuePolicy::Quorum);
        assert_eq!(handle.node(), "broker1");
        assert_eq!(handle.queue_address(), "amqp://broker1/vh/q1");
        assert_eq!(
            transport.declared_queues(),
            vec![QueueSpec::durable("q1", QueuePolicy::Quorum)]
        );

        manager.start().await.unwrap();
        let endpoint = manager
            .get_send_endpoint("amqp://broker1/vh/q1")
            .await
            .unwrap();
        assert_eq!(endpoint.address(), "amqp://broker1/vh/q1");

        endpoint.send(&TestMessage::new("hello")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "hello");

        manager.request_stop();
        manager.stop().await;
        assert_eq!(manager.history(), &[Idle, Connecting, Ready, Stopping, Closed]);
    }

    #[tokio::test]
    async fn test_connect_then_stop_never_invokes_consumer() {
        let transport = MemoryTransport::new();
        let (callback, calls) = counting_callback();
        let mut manager = manager_with(&transport, callback);

        manager.connect(&scenario_config()).await.unwrap();
        transport.inject("q1", br#"{"message":"early"}"#).unwrap();
        manager.stop().await;

        assert_eq!(manager.history(), &[Idle, Connecting, Ready, Closed]);
        assert_eq!(manager.state(), Closed);
        assert!(manager.handle().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let transport = MemoryTransport::new();
        let mut manager = manager_with(&transport, log_received());

        // Nothing to stop yet
        manager.stop().await;
        assert_eq!(manager.state(), Idle);

        manager.connect(&scenario_config()).await.unwrap();
        manager.start().await.unwrap();
        manager.stop().await;
        manager.stop().await;

        assert_eq!(manager.state(), Closed);
        assert_eq!(manager.history().iter().filter(|s| **s == Closed).count(), 1);
        assert!(!transport.has_consumer("q1"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_in_ready() {
        let transport = MemoryTransport::new();
        let mut manager = manager_with(&transport, log_received());
        manager.connect(&scenario_config()).await.unwrap();

        manager.start().await.unwrap();
        manager.start().await.unwrap();

        assert!(manager.handle().unwrap().is_started());
        assert_eq!(manager.state(), Ready);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_start_outside_ready_fails() {
        let transport = MemoryTransport::new();
        let mut manager = manager_with(&transport, log_received());

        assert!(matches!(manager.start().await, Err(StartError::InvalidState(Idle))));

        manager.connect(&scenario_config()).await.unwrap();
        manager.stop().await;
        assert!(matches!(manager.start().await, Err(StartError::InvalidState(Closed))));
    }

    #[tokio::test]
    async fn test_connect_transport_failure_moves_to_failed() {
        let transport = MemoryTransport::with_faults(FaultPlan {
            unreachable_nodes: vec!["broker1".into(), "n1".into(), "n2".into()],
            ..FaultPlan::default()
        });
        let mut manager = manager_with(&transport, log_received());

        let result = manager.connect(&scenario_config()).await;
        match result {
            Err(ConnectError::Transport { address, source }) => {
                assert_eq!(address, "amqp://broker1/vh/");
                assert!(matches!(source, TransportError::Unreachable { .. }));
            }
            Err(other) => panic!("expected transport error, got {}", other),
            Ok(_) => panic!("expected transport error, got a handle"),
        }
        assert_eq!(manager.history(), &[Idle, Connecting, Failed]);
        assert_eq!(transport.attempted_nodes(), vec!["broker1", "n1", "n2"]);

        // Failed is terminal
        manager.stop().await;
        assert_eq!(manager.state(), Failed);
        assert!(matches!(
            manager.connect(&scenario_config()).await,
            Err(ConnectError::InvalidState(Failed))
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_over_to_first_reachable_peer() {
        let transport = MemoryTransport::with_faults(FaultPlan {
            unreachable_nodes: vec!["broker1".into()],
            ..FaultPlan::default()
        });
        let mut manager = manager_with(&transport, log_received());

        let handle = manager.connect(&scenario_config()).await.unwrap();
        assert_eq!(handle.node(), "n1");
        assert_eq!(transport.attempted_nodes(), vec!["broker1", "n1"]);
    }

    #[tokio::test]
    async fn test_config_error_is_fatal_and_leaves_idle() {
        let transport = MemoryTransport::new();
        let mut manager = manager_with(&transport, log_received());
        let config = ConfigSnapshot::from_pairs([("uri", "amqp://"), ("host", "broker1")]);

        let result = manager.connect(&config).await;
        assert!(matches!(
            result,
            Err(ConnectError::Config(ConfigError::Missing(ref key))) if key == "virtualHost"
        ));
        assert_eq!(manager.history(), &[Idle]);
        assert!(transport.attempted_nodes().is_empty());
    }

    #[tokio::test]
    async fn test_get_send_endpoint_requires_start() {
        let transport = MemoryTransport::new();
        let mut manager = manager_with(&transport, log_received());

        assert!(matches!(
            manager.get_send_endpoint("amqp://broker1/vh/q1").await,
            Err(AddressError::Unavailable(Idle))
        ));

        manager.connect(&scenario_config()).await.unwrap();
        assert!(matches!(
            manager.get_send_endpoint("amqp://broker1/vh/q1").await,
            Err(AddressError::NotStarted)
        ));

        manager.start().await.unwrap();
        manager.request_stop();
        assert!(matches!(
            manager.get_send_endpoint("amqp://broker1/vh/q1").await,
            Err(AddressError::Unavailable(Stopping))
        ));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_get_send_endpoint_invalid_addresses() {
        let transport = MemoryTransport::new();
        let mut manager = manager_with(&transport, log_received());
        manager.connect(&scenario_config()).await.unwrap();
        manager.start().await.unwrap();

        for address in [
            "amqp://other/vh/q1",
            "amqp://broker1/vh/",
            "amqp://broker1/vh",
        ] {
            assert!(
                matches!(
                    manager.get_send_endpoint(address).await,
                    Err(AddressError::Invalid { .. })
                ),
                "address {} should be invalid",
                address
            );
        }

        assert!(matches!(
            manager.get_send_endpoint("amqp://broker1/vh/missing").await,
            Err(AddressError::Transport {
                source: TransportError::UnknownQueue(_),
                ..
            })
        ));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_queue_name_with_slash_resolves_own_address() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = handler(move |message: TestMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.message().to_string());
                Ok(())
            }
        });
        let mut manager = manager_with(&transport, consumer);
        let config = ConfigSnapshot::from_pairs(
            scenario_config()
                .iter()
                .map(|(key, value)| {
                    let value = if key == "queueName" { "orders/v1" } else { value };
                    (key.to_string(), value.to_string())
                })
                .collect::<Vec<_>>(),
        );

        let queue_address = manager.connect(&config).await.unwrap().queue_address();
        assert_eq!(queue_address, "amqp://broker1/vh/orders/v1");
        manager.start().await.unwrap();

        let endpoint = manager.get_send_endpoint(&queue_address).await.unwrap();
        endpoint.send(&TestMessage::new("nested")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, "nested");
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_send_endpoint_times_out_without_retry() {
        let transport = MemoryTransport::with_faults(FaultPlan {
            resolve_delay: Some(Duration::from_secs(60)),
            ..FaultPlan::default()
        });
        let mut manager = manager_with(&transport, log_received());
        manager.connect(&scenario_config()).await.unwrap();
        manager.start().await.unwrap();

        let started = tokio::time::Instant::now();
        let result = manager.get_send_endpoint("amqp://broker1/vh/q1").await;

        assert!(matches!(result, Err(AddressError::Timeout { timeout, .. }) if timeout == Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(60));
        // The failure does not disturb the connection
        assert_eq!(manager.state(), Ready);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_send_handle_wraps_transport_errors() {
        let mut endpoint = MockSendEndpoint::new();
        endpoint
            .expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Closed));

        let handle = SendHandle::new("amqp://broker1/vh/q1", Arc::new(endpoint));
        let error = handle.send(&TestMessage::new("hello")).await.unwrap_err();

        assert_eq!(error.address, "amqp://broker1/vh/q1");
        assert_eq!(error.payload, "hello");
        assert!(matches!(error.source, TransportError::Closed));
    }

    #[test]
    fn test_queue_from_address() {
        assert_eq!(
            queue_from_address("amqp://broker1/vh/", "amqp://broker1/vh/q1").unwrap(),
            "q1"
        );
        assert_eq!(
            queue_from_address("amqp://broker1/vh/", "amqp://broker1/vh/orders/v1").unwrap(),
            "orders/v1"
        );
        assert!(queue_from_address("amqp://broker1/vh/", "amqp://broker1/vh").is_err());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(Idle.to_string(), "Idle");
        assert_eq!(Failed.to_string(), "Failed");
    }
}
