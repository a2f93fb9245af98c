use std::sync::Arc;

use tokio::time;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::connection::{Connection, PhysicalConnection};
use crate::connection_id::ConnectionId;
use crate::error::{HandshakeError, TransportError};
use crate::transport::handshake_error::TransportHandshakeErrorHandler;
use crate::transport::transport_events::TransportEvent;
use crate::transport::{MessageTransport, RoleData, TransportStatus};
use crate::wire::handshake_messages::TransportHandshakeMessage;
use crate::wire::WireProtocolMessage;

impl MessageTransport {
    /// Server transports are created unattached; physical connections are attached by the
    ///  [crate::server::stack_provider::ServerStackProvider] when a client's SYN arrives.
    pub fn new_server(connection_id: ConnectionId, config: Arc<TransportConfig>, handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>) -> Arc<MessageTransport> {
        Self::new_with_role(RoleData::Server, connection_id, config, handshake_error_handler)
    }

    /// Installs a client's physical connection, replacing any previous one. The transport waits
    ///  for the client's ACK after this; returns the new connection generation.
    pub async fn attach_connection(&self, physical: PhysicalConnection, peer_callback_port: Option<u16>) -> Result<u64, TransportError> {
        match self.install_client_connection(physical, peer_callback_port) {
            Ok((generation, old)) => {
                if let Some(old) = old {
                    old.close().await;
                }
                Ok(generation)
            }
            Err(rejected) => {
                rejected.close().await;
                Err(TransportError::Closed)
            }
        }
    }

    /// The synchronous part of [MessageTransport::attach_connection], for callers that must install
    ///  the connection while holding a lock of their own. Returns the new generation and the
    ///  replaced connection, which the caller must close. If the transport is closed already, the
    ///  new connection is handed back for closing instead.
    pub(crate) fn install_client_connection(&self, physical: PhysicalConnection, peer_callback_port: Option<u16>) -> Result<(u64, Option<Arc<dyn Connection>>), Arc<dyn Connection>> {
        let mut state = self.state.lock();
        if state.status == TransportStatus::Closed {
            return Err(physical.connection);
        }

        let connection_number = physical.connection.connection_number();
        let (generation, old) = self.install_connection(&mut state, physical);
        state.peer_callback_port = peer_callback_port;
        self.set_status(&mut state, TransportStatus::OpenInProgress);

        if let Some(old) = &old {
            debug!("replacing connection #{} with #{}", old.connection_number(), connection_number);
        }
        Ok((generation, old))
    }

    /// send a handshake reply on the connection of the given generation
    pub(crate) async fn send_handshake(&self, generation: u64, msg: WireProtocolMessage) -> Result<(), TransportError> {
        let connection = {
            let state = self.state.lock();
            if state.generation != generation {
                return Err(TransportError::NotConnected);
            }
            state.connection.clone()
        };
        match connection {
            Some(connection) => connection.send(msg).await
                .map_err(|e| TransportError::ConnectionLost(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    /// If the client's ACK has not arrived within the handshake timeout, the connection is
    ///  taken down
    pub(crate) fn spawn_handshake_timeout(&self, generation: u64) {
        let transport = self.myself.clone();
        let timeout = self.config.handshake_timeout;

        tokio::spawn(async move {
            time::sleep(timeout).await;
            if let Some(transport) = transport.upgrade() {
                let timed_out = {
                    let state = transport.state.lock();
                    state.generation == generation && state.status == TransportStatus::OpenInProgress
                };
                if timed_out {
                    transport.handshake_failed(generation, HandshakeError::Timeout { millis: timeout.as_millis() }).await;
                }
            }
        });
    }

    pub(crate) async fn on_server_handshake_message(&self, generation: u64, msg: TransportHandshakeMessage) {
        let connected = match &msg {
            TransportHandshakeMessage::Ack(ack) => {
                let mut state = self.state.lock();
                if state.generation == generation && state.status == TransportStatus::OpenInProgress && ack.connection_id == state.connection_id {
                    self.set_status(&mut state, TransportStatus::Connected);
                    true
                }
                else {
                    false
                }
            }
            _ => false,
        };

        if connected {
            let connection_id = self.connection_id();
            info!("client {} connected", connection_id);
            self.fire(vec![TransportEvent::Connected(connection_id)]);
        }
        else {
            let e = self.unexpected_handshake_message(&msg);
            self.handshake_failed(generation, e).await;
        }
    }
}
