use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::connection::stream_connection::StreamConnection;
use crate::connection::{Connection, ConnectionEvent, PhysicalConnection};
use crate::connection_id::ConnectionId;
use crate::error::{AttachError, HandshakeError};
use crate::server::stack_provider::ServerStackProvider;
use crate::stack::NetworkStackHarness;
use crate::transport::handshake_error::{HandshakeErrorContext, TransportHandshakeErrorHandler};
use crate::wire::handshake_messages::{SynMessage, TransportHandshakeMessage};
use crate::wire::message_factory::TransportMessageFactory;

/// Server half of the handshake for newly accepted physical connections: waits for the client's
///  SYN, attaches the connection to its stack and answers with SYN_ACK. The transport then waits
///  for the client's ACK.
pub struct ServerConnectionAcceptor {
    config: Arc<TransportConfig>,
    provider: Arc<ServerStackProvider>,
    message_factory: TransportMessageFactory,
    handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>,
}

impl ServerConnectionAcceptor {
    pub fn new(config: Arc<TransportConfig>, provider: Arc<ServerStackProvider>, handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>) -> ServerConnectionAcceptor {
        ServerConnectionAcceptor {
            message_factory: TransportMessageFactory::new(&config),
            config,
            provider,
            handshake_error_handler,
        }
    }

    pub fn provider(&self) -> &Arc<ServerStackProvider> {
        &self.provider
    }

    /// Returns the stack the connection was attached to, or `None` if the handshake failed or
    ///  the client was rejected. Either way the outcome is logged and handshake problems are
    ///  reported; a failed connection is closed.
    #[instrument(name="accept", skip_all, fields(connection = physical.connection.connection_number()))]
    pub async fn accept(&self, mut physical: PhysicalConnection) -> Option<Arc<dyn NetworkStackHarness>> {
        let connection = physical.connection.clone();

        let syn = match self.receive_syn(&mut physical).await {
            Ok(syn) => syn,
            Err(e) => {
                self.report(&connection, &ConnectionId::NULL_ID, e);
                connection.close().await;
                return None;
            }
        };
        debug!("received SYN for {}", syn.connection_id);

        if syn.stack_layer_flags != self.message_factory.stack_layer_flags() {
            let e = HandshakeError::StackLayerMismatch { peer: syn.stack_layer_flags, local: self.message_factory.stack_layer_flags() };
            self.reject(&connection, &syn.connection_id, &e.to_string(), false).await;
            self.report(&connection, &syn.connection_id, e);
            return None;
        }

        match self.provider.attach_new_connection(&syn.connection_id, physical, syn.callback_port).await {
            Ok(attached) => {
                let transport = attached.harness.transport();
                let connection_id = transport.connection_id();
                if let Err(e) = transport.send_handshake(attached.generation, self.message_factory.create_syn_ack(&connection_id)).await {
                    debug!("could not send SYN_ACK to {}: {}", connection_id, e);
                }
                transport.spawn_handshake_timeout(attached.generation);
                Some(attached.harness)
            }
            Err(e) => {
                info!("rejecting {}: {}", syn.connection_id, e);
                let max_connections_exceeded = matches!(e, AttachError::MaxConnectionsExceeded { .. });
                self.reject(&connection, &syn.connection_id, &e.to_string(), max_connections_exceeded).await;
                self.report(&connection, &syn.connection_id, e.into());
                None
            }
        }
    }

    async fn receive_syn(&self, physical: &mut PhysicalConnection) -> Result<SynMessage, HandshakeError> {
        let timeout = self.config.handshake_timeout;
        let evt = match time::timeout(timeout, physical.events.recv()).await {
            Ok(evt) => evt,
            Err(_) => return Err(HandshakeError::Timeout { millis: timeout.as_millis() }),
        };

        match evt {
            Some(ConnectionEvent::Message(msg)) => match TransportHandshakeMessage::from_wire_message(&msg)? {
                TransportHandshakeMessage::Syn(syn) => Ok(syn),
                other => Err(HandshakeError::UnexpectedMessage { kind: other.kind_name(), status: "NEW" }),
            },
            Some(ConnectionEvent::Closed(_)) | None => Err(HandshakeError::ConnectionClosed),
        }
    }

    async fn reject(&self, connection: &Arc<dyn Connection>, connection_id: &ConnectionId, reason: &str, max_connections_exceeded: bool) {
        let msg = self.message_factory.create_syn_ack_reject(connection_id, reason, max_connections_exceeded, self.provider.policy().max_connections());
        if let Err(e) = connection.send(msg).await {
            debug!("could not send rejection: {}", e);
        }
        connection.close().await;
    }

    fn report(&self, connection: &Arc<dyn Connection>, connection_id: &ConnectionId, error: HandshakeError) {
        self.handshake_error_handler.handle_handshake_error(&HandshakeErrorContext {
            connection_number: connection.connection_number(),
            peer_addr: connection.peer_addr(),
            connection_id: connection_id.clone(),
            error,
        });
    }
}

/// Accepts TCP connections until the listener fails, running each handshake on a separate task
pub async fn run_tcp_accept_loop(listener: TcpListener, acceptor: Arc<ServerConnectionAcceptor>) -> anyhow::Result<()> {
    info!("accepting connections on {:?}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let physical = StreamConnection::spawn(stream, Some(addr), &acceptor.config);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            acceptor.accept(physical).await;
        });
    }
}
