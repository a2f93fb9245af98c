pub mod client_transport;
pub mod connection_establisher;
pub mod handshake_error;
pub mod server_transport;
pub mod transport_events;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionEvent, PhysicalConnection};
use crate::connection_id::ConnectionId;
use crate::error::{HandshakeError, TransportError};
use crate::transport::connection_establisher::ClientConnectionEstablisher;
use crate::transport::handshake_error::{HandshakeErrorContext, TransportHandshakeErrorHandler};
use crate::transport::transport_events::{TransportEvent, TransportEventNotifier, TransportListener};
use crate::wire::handshake_messages::{SynAckMessage, TransportHandshakeMessage};
use crate::wire::health_check_messages::HealthCheckMessage;
use crate::wire::message_factory::TransportMessageFactory;
use crate::wire::{ProtocolType, WireProtocolMessage};

/// The layer above a transport: receives application and reliable-delivery messages
#[async_trait]
pub trait WireProtocolMessageSink: Send + Sync + 'static {
    async fn put_message(&self, message: WireProtocolMessage);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportStatus {
    New,
    OpenInProgress,
    Connected,
    Reconnecting,
    /// terminal
    Closed,
}

impl TransportStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TransportStatus::New => "NEW",
            TransportStatus::OpenInProgress => "OPEN_IN_PROGRESS",
            TransportStatus::Connected => "CONNECTED",
            TransportStatus::Reconnecting => "RECONNECTING",
            TransportStatus::Closed => "CLOSED",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportRole {
    Client,
    Server,
}

enum RoleData {
    Client(ClientConnectionEstablisher),
    Server,
}

struct TransportState {
    status: TransportStatus,
    connection_id: ConnectionId,
    connection: Option<Arc<dyn Connection>>,
    /// incremented whenever the physical connection is installed or lost: events and verdicts
    ///  referring to an older generation are stale
    generation: u64,
    was_opened: bool,
    /// client side: the SYN_ACK the current handshake is waiting for
    pending_handshake: Option<oneshot::Sender<SynAckMessage>>,
    peer_callback_port: Option<u16>,
}

/// A logical connection between a client and a server. It owns one physical connection at a
///  time and keeps its identity (and [ConnectionId]) when the physical connection is replaced
///  after a reconnect.
///
/// Client and server transports share this type; role specific behavior lives in
///  [client_transport] and [server_transport].
pub struct MessageTransport {
    myself: Weak<MessageTransport>,
    role: RoleData,
    config: Arc<TransportConfig>,
    message_factory: TransportMessageFactory,
    state: Mutex<TransportState>,
    status_watch: watch::Sender<TransportStatus>,
    last_received: Mutex<Instant>,
    receive_layer: RwLock<Option<Arc<dyn WireProtocolMessageSink>>>,
    notifier: TransportEventNotifier,
    handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>,
}

impl MessageTransport {
    fn new_with_role(role: RoleData, connection_id: ConnectionId, config: Arc<TransportConfig>, handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>) -> Arc<MessageTransport> {
        let (status_watch, _) = watch::channel(TransportStatus::New);

        Arc::new_cyclic(|myself| MessageTransport {
            myself: myself.clone(),
            role,
            message_factory: TransportMessageFactory::new(&config),
            config,
            state: Mutex::new(TransportState {
                status: TransportStatus::New,
                connection_id,
                connection: None,
                generation: 0,
                was_opened: false,
                pending_handshake: None,
                peer_callback_port: None,
            }),
            status_watch,
            last_received: Mutex::new(Instant::now()),
            receive_layer: Default::default(),
            notifier: TransportEventNotifier::new(),
            handshake_error_handler,
        })
    }

    pub fn role(&self) -> TransportRole {
        match &self.role {
            RoleData::Client(_) => TransportRole::Client,
            RoleData::Server => TransportRole::Server,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.state.lock().connection_id.clone()
    }

    pub fn status(&self) -> TransportStatus {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == TransportStatus::Connected
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status(), TransportStatus::OpenInProgress | TransportStatus::Connected | TransportStatus::Reconnecting)
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// the point in time when the last message of any kind was received
    pub fn last_received(&self) -> Instant {
        *self.last_received.lock()
    }

    /// The address where the peer accepts connect-back checks: the peer's IP address with the
    ///  callback port it published during the handshake
    pub fn peer_callback_addr(&self) -> Option<SocketAddr> {
        let state = self.state.lock();
        let port = state.peer_callback_port?;
        let peer_addr = state.connection.as_ref()?.peer_addr()?;
        Some(SocketAddr::new(peer_addr.ip(), port))
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.notifier.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransportListener>) {
        self.notifier.remove_listener(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.notifier.subscribe()
    }

    pub fn status_changes(&self) -> watch::Receiver<TransportStatus> {
        self.status_watch.subscribe()
    }

    pub fn set_receive_layer(&self, receive_layer: Arc<dyn WireProtocolMessageSink>) {
        *self.receive_layer.write() = Some(receive_layer);
    }

    pub async fn send(&self, message: WireProtocolMessage) -> Result<(), TransportError> {
        self.check_frame_len(&message)?;
        let connection = self.connected_connection()?;
        connection.send(message).await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    /// Sends several messages, batched into as few frames as possible. Either all messages are
    ///  accepted for sending or none is.
    pub async fn send_batch(&self, messages: Vec<WireProtocolMessage>) -> Result<(), TransportError> {
        for message in &messages {
            self.check_frame_len(message)?;
        }
        let connection = self.connected_connection()?;
        if messages.is_empty() {
            return Ok(());
        }
        connection.send_batch(messages).await
            .map_err(|e| TransportError::ConnectionLost(e.to_string()))
    }

    /// the peer treats oversized frames as corrupt and drops the connection
    fn check_frame_len(&self, message: &WireProtocolMessage) -> Result<(), TransportError> {
        let max = self.config.max_frame_size as usize;
        if message.frame_len() > max {
            return Err(TransportError::MessageTooLarge { len: message.frame_len(), max });
        }
        Ok(())
    }

    fn connected_connection(&self) -> Result<Arc<dyn Connection>, TransportError> {
        let state = self.state.lock();
        match (state.status, &state.connection) {
            (TransportStatus::Connected, Some(connection)) => Ok(connection.clone()),
            (TransportStatus::Closed, _) => Err(TransportError::Closed),
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Sends a health check probe on the current connection. Returns false if there is no
    ///  connection or sending failed.
    pub async fn send_ping(&self, seq: u64) -> bool {
        match self.send_raw(self.message_factory.create_ping(seq)).await {
            Ok(()) => true,
            Err(e) => {
                debug!("could not send ping on {}: {}", self.connection_id(), e);
                false
            }
        }
    }

    /// send on the current physical connection regardless of status
    async fn send_raw(&self, message: WireProtocolMessage) -> anyhow::Result<()> {
        let connection = self.state.lock().connection.clone();
        match connection {
            Some(connection) => connection.send(message).await,
            None => Err(anyhow::anyhow!("no physical connection")),
        }
    }

    /// Closes the transport for good. Closing is idempotent; an in-progress connect or
    ///  reconnect is cancelled.
    pub async fn close(&self) {
        let (connection_id, connection) = {
            let mut state = self.state.lock();
            if state.status == TransportStatus::Closed {
                return;
            }
            state.generation += 1;
            state.pending_handshake = None;
            self.set_status(&mut state, TransportStatus::Closed);
            (state.connection_id.clone(), state.connection.take())
        };

        info!("closed transport {}", connection_id);
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.fire(vec![TransportEvent::Closed(connection_id)]);
    }

    /// Takes the physical connection down if it is still the one of the given generation. This
    ///  is how the health checker applies a death verdict: if a reconnect installed a new
    ///  connection in the meantime, the verdict is stale and nothing happens.
    pub async fn disconnect_if_generation(&self, generation: u64) -> bool {
        self.connection_lost(generation, true).await
    }

    fn set_status(&self, state: &mut TransportState, status: TransportStatus) {
        if state.status != status {
            debug!("transport {}: {} -> {}", state.connection_id, state.status.name(), status.name());
        }
        state.status = status;
        self.status_watch.send_replace(status);
    }

    /// must be called with the state lock held
    fn install_connection(&self, state: &mut TransportState, physical: PhysicalConnection) -> (u64, Option<Arc<dyn Connection>>) {
        let old = state.connection.replace(physical.connection);
        state.generation += 1;
        state.pending_handshake = None;
        let generation = state.generation;

        *self.last_received.lock() = Instant::now();
        tokio::spawn(receive_loop(self.myself.clone(), generation, physical.events));
        (generation, old)
    }

    /// Drops the connection of the given generation without a status change. Used when a
    ///  handshake attempt fails: the establisher decides what happens next.
    async fn drop_connection(&self, generation: u64) {
        let connection = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.generation += 1;
            state.pending_handshake = None;
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    async fn connection_lost(&self, generation: u64, forced: bool) -> bool {
        let mut reconnect = false;
        let (connection, events) = {
            let mut state = self.state.lock();
            if state.generation != generation || state.connection.is_none() {
                return false;
            }
            let connection = state.connection.take();
            state.generation += 1;
            state.pending_handshake = None;

            let connection_id = state.connection_id.clone();
            let disconnected = TransportEvent::Disconnected { connection_id: connection_id.clone(), forced, generation };

            let events = match (self.role(), state.status) {
                (TransportRole::Client, TransportStatus::Connected) => {
                    if self.config.max_reconnect_tries.allows_reconnect() {
                        self.set_status(&mut state, TransportStatus::Reconnecting);
                        reconnect = true;
                        vec![disconnected]
                    }
                    else {
                        self.set_status(&mut state, TransportStatus::Closed);
                        vec![disconnected, TransportEvent::Closed(connection_id)]
                    }
                }
                (TransportRole::Server, TransportStatus::OpenInProgress | TransportStatus::Connected) => {
                    if self.config.server_reconnect_window.is_some() {
                        self.set_status(&mut state, TransportStatus::Reconnecting);
                        vec![disconnected]
                    }
                    else {
                        self.set_status(&mut state, TransportStatus::Closed);
                        vec![disconnected, TransportEvent::Closed(connection_id)]
                    }
                }
                // a handshake is in progress: it notices and the establisher takes over
                _ => vec![],
            };
            (connection, events)
        };

        // closing may take a while, listeners are notified first
        self.fire(events);
        if let Some(connection) = connection {
            debug!("lost connection #{} (forced: {})", connection.connection_number(), forced);
            connection.close().await;
        }
        if reconnect {
            self.spawn_reconnect();
        }
        true
    }

    fn fire(&self, events: Vec<TransportEvent>) {
        if let Some(myself) = self.myself.upgrade() {
            for event in events {
                self.notifier.notify(&myself, event);
            }
        }
    }

    fn notify_connect_attempt(&self) {
        self.fire(vec![TransportEvent::ConnectAttempt(self.connection_id())]);
    }

    fn report_handshake_error(&self, connection: Option<&Arc<dyn Connection>>, error: HandshakeError) {
        self.handshake_error_handler.handle_handshake_error(&HandshakeErrorContext {
            connection_number: connection.map(|c| c.connection_number()).unwrap_or(0),
            peer_addr: connection.and_then(|c| c.peer_addr()),
            connection_id: self.connection_id(),
            error,
        });
    }

    /// report, then take the connection down
    async fn handshake_failed(&self, generation: u64, error: HandshakeError) {
        let connection = self.state.lock().connection.clone();
        self.report_handshake_error(connection.as_ref(), error);
        self.connection_lost(generation, true).await;
    }

    fn unexpected_handshake_message(&self, msg: &TransportHandshakeMessage) -> HandshakeError {
        HandshakeError::UnexpectedMessage {
            kind: msg.kind_name(),
            status: self.status().name(),
        }
    }

    async fn on_message(&self, generation: u64, msg: WireProtocolMessage) {
        {
            let state = self.state.lock();
            if state.generation != generation || state.status == TransportStatus::Closed {
                trace!("dropping message from stale connection: {:?}", msg.protocol);
                return;
            }
        }
        *self.last_received.lock() = Instant::now();

        match msg.protocol {
            ProtocolType::TransportHandshake => {
                match TransportHandshakeMessage::from_wire_message(&msg) {
                    Ok(handshake) => match self.role {
                        RoleData::Client(_) => self.on_client_handshake_message(generation, handshake).await,
                        RoleData::Server => self.on_server_handshake_message(generation, handshake).await,
                    },
                    Err(e) => self.handshake_failed(generation, e).await,
                }
            }
            ProtocolType::HealthCheck => {
                match HealthCheckMessage::try_deser(&mut msg.payload.clone()) {
                    Ok(health_check) => {
                        trace!("received {:?}", health_check);
                        if let Some(reply) = self.message_factory.create_ping_response(&health_check) {
                            if let Err(e) = self.send_raw(reply).await {
                                debug!("could not reply to ping: {}", e);
                            }
                        }
                    }
                    Err(e) => warn!("received malformed health check message - ignoring: {}", e),
                }
            }
            ProtocolType::Application | ProtocolType::ReliableDelivery => {
                let receive_layer = self.receive_layer.read().clone();
                match receive_layer {
                    Some(receive_layer) => receive_layer.put_message(msg).await,
                    None => warn!("no receive layer registered - dropping {:?} message", msg.protocol),
                }
            }
            ProtocolType::Group => warn!("received nested group message - ignoring"),
        }
    }
}

async fn receive_loop(transport: Weak<MessageTransport>, generation: u64, mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(evt) = events.recv().await {
        let transport = match transport.upgrade() {
            Some(t) => t,
            None => return,
        };

        match evt {
            ConnectionEvent::Message(msg) => transport.on_message(generation, msg).await,
            ConnectionEvent::Closed(reason) => {
                debug!("connection of {} closed: {:?}", transport.connection_id(), reason);
                transport.connection_lost(generation, false).await;
                return;
            }
        }
    }

    if let Some(transport) = transport.upgrade() {
        transport.connection_lost(generation, false).await;
    }
}

/// resolves when the watched transport is closed (or dropped)
pub(crate) async fn wait_closed(status: &mut watch::Receiver<TransportStatus>) {
    let _ = status.wait_for(|s| *s == TransportStatus::Closed).await;
}
