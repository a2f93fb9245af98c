use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio::time;

use crate::config::{BackoffConfig, RetryBudget, TransportConfig};
use crate::connection::stream_connection::StreamConnection;
use crate::connection::{next_connection_number, CloseReason, Connection, ConnectionEvent, ConnectionFactory, PhysicalConnection};
use crate::connection_id::ConnectionIdFactory;
use crate::server::acceptor::ServerConnectionAcceptor;
use crate::server::connection_policy::ConnectionPolicy;
use crate::server::stack_provider::ServerStackProvider;
use crate::stack::plain_harness::PlainNetworkStackHarnessFactory;
use crate::transport::connection_establisher::ConnectionAddressProvider;
use crate::transport::handshake_error::{HandshakeErrorContext, LoggingHandshakeErrorHandler, TransportHandshakeErrorHandler};
use crate::transport::transport_events::{TransportEvent, TransportListener};
use crate::transport::MessageTransport;
use crate::wire::WireProtocolMessage;

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// short timeouts and delays, unbounded reconnects, a server reconnect window of one minute
pub fn test_config() -> TransportConfig {
    TransportConfig {
        handshake_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        max_reconnect_tries: RetryBudget::Unbounded,
        reconnect_backoff: BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            factor_eighths: 16,
        },
        server_reconnect_window: Some(Duration::from_secs(60)),
        connection_event_queue_size: 64,
        ..TransportConfig::new()
    }
}

/// A [Connection] that records sent messages, with received events injected by test code
pub struct FakeConnection {
    connection_number: u64,
    peer_addr: Option<SocketAddr>,
    events: mpsc::Sender<ConnectionEvent>,
    sent: Mutex<Vec<WireProtocolMessage>>,
    sent_notify: Notify,
    closed: AtomicBool,
    close_delay: Mutex<Option<Duration>>,
}

impl FakeConnection {
    pub fn new(peer_addr: Option<SocketAddr>) -> (Arc<FakeConnection>, PhysicalConnection) {
        let (events, events_recv) = mpsc::channel(64);
        let fake = Arc::new(FakeConnection {
            connection_number: next_connection_number(),
            peer_addr,
            events,
            sent: Default::default(),
            sent_notify: Notify::new(),
            closed: AtomicBool::new(false),
            close_delay: Default::default(),
        });
        let physical = PhysicalConnection {
            connection: fake.clone(),
            events: events_recv,
        };
        (fake, physical)
    }

    /// simulate receiving a message
    pub async fn inject(&self, message: WireProtocolMessage) {
        let _ = self.events.send(ConnectionEvent::Message(message)).await;
    }

    /// simulate the connection breaking
    pub async fn inject_close(&self, reason: CloseReason) {
        self.closed.store(true, Ordering::Release);
        let _ = self.events.send(ConnectionEvent::Closed(reason)).await;
    }

    /// simulate a close that takes a while, e.g. flushing to a slow peer
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    pub fn is_closed_now(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn sent_messages(&self) -> Vec<WireProtocolMessage> {
        self.sent.lock().clone()
    }

    /// waits for a sent message matching the predicate, returning the first one
    pub async fn wait_for_sent(&self, pred: impl Fn(&WireProtocolMessage) -> bool) -> WireProtocolMessage {
        let wait = async {
            loop {
                let notified = self.sent_notify.notified();
                if let Some(msg) = self.sent.lock().iter().find(|m| pred(m)) {
                    return msg.clone();
                }
                notified.await;
            }
        };
        time::timeout(WAIT_TIMEOUT, wait).await
            .expect("timeout waiting for sent message")
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn connection_number(&self) -> u64 {
        self.connection_number
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    async fn send(&self, message: WireProtocolMessage) -> anyhow::Result<()> {
        if self.is_closed_now() {
            bail!("connection #{} is closed", self.connection_number);
        }
        self.sent.lock().push(message);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn send_batch(&self, messages: Vec<WireProtocolMessage>) -> anyhow::Result<()> {
        if self.is_closed_now() {
            bail!("connection #{} is closed", self.connection_number);
        }
        self.sent.lock().extend(messages);
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        let close_delay = *self.close_delay.lock();
        if let Some(delay) = close_delay {
            time::sleep(delay).await;
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.events.try_send(ConnectionEvent::Closed(CloseReason::LocalClose));
        }
    }

    fn is_closed(&self) -> bool {
        self.is_closed_now()
    }
}

#[derive(Default)]
pub struct RecordingHandshakeErrorHandler {
    errors: Mutex<Vec<HandshakeErrorContext>>,
    notify: Notify,
}

impl RecordingHandshakeErrorHandler {
    pub fn errors(&self) -> Vec<HandshakeErrorContext> {
        self.errors.lock().clone()
    }

    pub async fn wait_for_errors(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.errors.lock().len() >= n {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(WAIT_TIMEOUT, wait).await
            .expect("timeout waiting for handshake errors");
    }
}

impl TransportHandshakeErrorHandler for RecordingHandshakeErrorHandler {
    fn handle_handshake_error(&self, context: &HandshakeErrorContext) {
        self.errors.lock().push(context.clone());
        self.notify.notify_waiters();
    }
}

/// Records all events of a transport
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<TransportEvent>>,
    notify: Notify,
}

impl EventCollector {
    /// records the events of all transports created by the provider from now on
    pub fn register_with_provider(provider: &ServerStackProvider) -> Arc<EventCollector> {
        let collector = Arc::new(EventCollector::default());
        provider.add_transport_listener(collector.clone());
        collector
    }

    pub fn register(transport: &Arc<MessageTransport>) -> Arc<EventCollector> {
        let collector = Arc::new(EventCollector::default());
        transport.add_listener(collector.clone());
        collector
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&TransportEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub async fn wait_for(&self, pred: impl Fn(&TransportEvent) -> bool) {
        self.wait_for_count(pred, 1).await
    }

    pub async fn wait_for_count(&self, pred: impl Fn(&TransportEvent) -> bool, n: usize) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if self.count(&pred) >= n {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(WAIT_TIMEOUT, wait).await
            .expect("timeout waiting for transport events");
    }
}

impl TransportListener for EventCollector {
    fn on_transport_event(&self, _transport: &Arc<MessageTransport>, event: &TransportEvent) {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
    }
}

/// Connects client transports to [ServerConnectionAcceptor]s through in-memory streams. Servers
///  are bound to socket addresses, connecting to an address without a server fails like a
///  refused TCP connection.
pub struct InMemoryNetwork {
    config: TransportConfig,
    servers: Mutex<FxHashMap<SocketAddr, Arc<ServerConnectionAcceptor>>>,
    server_connections: Mutex<Vec<(SocketAddr, Arc<dyn Connection>)>>,
    next_client_port: AtomicU16,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Arc::new(InMemoryNetwork {
            config: test_config(),
            servers: Default::default(),
            server_connections: Default::default(),
            next_client_port: AtomicU16::new(40000),
        })
    }

    pub fn bind(&self, addr: SocketAddr, acceptor: Arc<ServerConnectionAcceptor>) {
        self.servers.lock().insert(addr, acceptor);
    }

    pub fn unbind(&self, addr: SocketAddr) {
        self.servers.lock().remove(&addr);
    }

    /// closes the server side of all connections to the given address
    pub async fn break_connections(&self, addr: SocketAddr) {
        let connections = {
            let mut server_connections = self.server_connections.lock();
            let (broken, kept) = std::mem::take(&mut *server_connections).into_iter()
                .partition::<Vec<_>, _>(|(a, _)| *a == addr);
            *server_connections = kept;
            broken
        };
        for (_, connection) in connections {
            connection.close().await;
        }
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryNetwork {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<PhysicalConnection> {
        let acceptor = match self.servers.lock().get(&addr) {
            Some(acceptor) => acceptor.clone(),
            None => bail!("connection refused: {}", addr),
        };

        let client_addr = SocketAddr::new([10, 99, 0, 1].into(), self.next_client_port.fetch_add(1, Ordering::Relaxed));
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);

        let server_physical = StreamConnection::spawn(server_stream, Some(client_addr), &self.config);
        self.server_connections.lock().push((addr, server_physical.connection.clone()));
        tokio::spawn(async move {
            acceptor.accept(server_physical).await;
        });

        Ok(StreamConnection::spawn(client_stream, Some(addr), &self.config))
    }
}

pub struct TestServer {
    pub provider: Arc<ServerStackProvider>,
    pub acceptor: Arc<ServerConnectionAcceptor>,
    /// events of all server transports
    pub events: Arc<EventCollector>,
}

impl TestServer {
    pub async fn start(network: &Arc<InMemoryNetwork>, addr: SocketAddr, config: TransportConfig) -> TestServer {
        let config = Arc::new(config);
        let handler = Arc::new(LoggingHandshakeErrorHandler {});
        let (harness_factory, _) = PlainNetworkStackHarnessFactory::new(64);
        let provider = ServerStackProvider::new(
            config.clone(),
            Arc::new(ConnectionIdFactory::new()),
            Arc::new(harness_factory),
            Arc::new(ConnectionPolicy::new(config.max_connections)),
            handler.clone(),
        );
        let events = EventCollector::register_with_provider(&provider);
        let acceptor = Arc::new(ServerConnectionAcceptor::new(config, provider.clone(), handler));
        network.bind(addr, acceptor.clone());

        TestServer {
            provider,
            acceptor,
            events,
        }
    }

    /// Stacks are added before their transport reports the handshake, and removed when it
    ///  reports being closed, so every change of the count is followed by an event
    pub async fn wait_for_stacks(&self, n: usize) {
        let wait = async {
            loop {
                let notified = self.events.notify.notified();
                if self.provider.stack_count() >= n {
                    return;
                }
                notified.await;
            }
        };
        time::timeout(WAIT_TIMEOUT, wait).await
            .expect("timeout waiting for server stacks");
    }
}

pub fn client_transport(network: &Arc<InMemoryNetwork>, config: TransportConfig, addresses: Vec<SocketAddr>) -> Arc<MessageTransport> {
    client_transport_with_handler(network.clone(), config, addresses, Arc::new(LoggingHandshakeErrorHandler {}))
}

pub fn client_transport_with_handler(
    connection_factory: Arc<dyn ConnectionFactory>,
    config: TransportConfig,
    addresses: Vec<SocketAddr>,
    handler: Arc<dyn TransportHandshakeErrorHandler>,
) -> Arc<MessageTransport> {
    MessageTransport::new_client(
        Arc::new(config),
        connection_factory,
        ConnectionAddressProvider::new(addresses).unwrap(),
        handler,
    )
}

/// Hands out a [FakeConnection] for every connect, passing it on to test code
pub struct FakeConnectionFactory {
    connections: mpsc::UnboundedSender<Arc<FakeConnection>>,
}

impl FakeConnectionFactory {
    pub fn new() -> (Arc<FakeConnectionFactory>, mpsc::UnboundedReceiver<Arc<FakeConnection>>) {
        let (connections, connections_recv) = mpsc::unbounded_channel();
        (Arc::new(FakeConnectionFactory { connections }), connections_recv)
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<PhysicalConnection> {
        let (fake, physical) = FakeConnection::new(Some(addr));
        let _ = self.connections.send(fake);
        Ok(physical)
    }
}
