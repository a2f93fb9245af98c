use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use crate::config::TransportConfig;
use crate::connection::{ConnectionFactory, PhysicalConnection};
use crate::connection_id::ConnectionId;
use crate::error::{HandshakeError, TransportError};
use crate::transport::connection_establisher::{ClientConnectionEstablisher, ConnectionAddressProvider, EstablishMode};
use crate::transport::handshake_error::TransportHandshakeErrorHandler;
use crate::transport::{MessageTransport, RoleData, TransportStatus};
use crate::transport::transport_events::TransportEvent;
use crate::wire::handshake_messages::TransportHandshakeMessage;

impl MessageTransport {
    pub fn new_client(
        config: Arc<TransportConfig>,
        connection_factory: Arc<dyn ConnectionFactory>,
        address_provider: ConnectionAddressProvider,
        handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>,
    ) -> Arc<MessageTransport> {
        let establisher = ClientConnectionEstablisher::new(config.clone(), connection_factory, address_provider);
        Self::new_with_role(RoleData::Client(establisher), ConnectionId::NULL_ID, config, handshake_error_handler)
    }

    pub(crate) fn establisher(&self) -> Option<&ClientConnectionEstablisher> {
        match &self.role {
            RoleData::Client(establisher) => Some(establisher),
            RoleData::Server => None,
        }
    }

    /// Connects to one of the configured servers and performs the handshake, retrying according
    ///  to the configured retry budget. Resolves when the transport is connected or when the
    ///  attempt is given up, in which case the transport is closed.
    ///
    /// A transport can be opened only once; a second call is a programming error and panics.
    pub async fn open(&self) -> Result<ConnectionId, TransportError> {
        let establisher = self.establisher()
            .expect("open() is only supported for client transports");

        {
            let mut state = self.state.lock();
            assert!(!state.was_opened, "open() was called twice on the same transport");
            state.was_opened = true;
            if state.status == TransportStatus::Closed {
                return Err(TransportError::Closed);
            }
            self.set_status(&mut state, TransportStatus::OpenInProgress);
        }

        match establisher.establish(self, EstablishMode::Open).await {
            Ok(()) => Ok(self.connection_id()),
            Err(e) => {
                info!("could not open transport: {}", e);
                self.close().await;
                Err(e)
            }
        }
    }

    /// Client half of the handshake on a freshly established physical connection: send SYN,
    ///  wait for SYN_ACK, send ACK.
    #[instrument(skip_all, fields(connection = physical.connection.connection_number()))]
    pub(crate) async fn client_handshake(&self, physical: PhysicalConnection) -> Result<(), TransportError> {
        let connection = physical.connection.clone();
        let (syn_ack_send, syn_ack_recv) = oneshot::channel();

        let installed = {
            let mut state = self.state.lock();
            if state.status == TransportStatus::Closed {
                None
            }
            else {
                let (generation, old) = self.install_connection(&mut state, physical);
                state.pending_handshake = Some(syn_ack_send);
                Some((generation, old, state.connection_id.clone()))
            }
        };
        let (generation, old, connection_id) = match installed {
            Some(x) => x,
            None => {
                connection.close().await;
                return Err(TransportError::Closed);
            }
        };
        if let Some(old) = old {
            old.close().await;
        }

        debug!("sending SYN for {} on connection #{}", connection_id, connection.connection_number());
        if let Err(e) = connection.send(self.message_factory.create_syn(&connection_id)).await {
            self.drop_connection(generation).await;
            return Err(TransportError::ConnectionLost(e.to_string()));
        }

        let syn_ack = match time::timeout(self.config.handshake_timeout, syn_ack_recv).await {
            Ok(Ok(syn_ack)) => syn_ack,
            Ok(Err(_)) => {
                self.report_handshake_error(Some(&connection), HandshakeError::ConnectionClosed);
                self.drop_connection(generation).await;
                return Err(TransportError::ConnectionLost("connection closed during handshake".to_string()));
            }
            Err(_) => {
                self.report_handshake_error(Some(&connection), HandshakeError::Timeout { millis: self.config.handshake_timeout.as_millis() });
                self.drop_connection(generation).await;
                return Err(TransportError::HandshakeTimeout);
            }
        };

        if let Some(rejection) = syn_ack.rejection {
            warn!("server rejected connection: {}", rejection.reason);
            self.report_handshake_error(Some(&connection), HandshakeError::RejectedByServer(rejection.reason.clone()));
            self.drop_connection(generation).await;
            return Err(TransportError::Rejected {
                reason: rejection.reason,
                max_connections_exceeded: rejection.max_connections_exceeded,
                max_connections: rejection.max_connections,
            });
        }

        let handshake_error = if syn_ack.connection_id.is_null() {
            Some(HandshakeError::Malformed("server assigned the null connection id".to_string()))
        }
        else if !connection_id.is_null() && syn_ack.connection_id != connection_id {
            Some(HandshakeError::ConnectionIdMismatch { expected: connection_id.clone(), assigned: syn_ack.connection_id.clone() })
        }
        else {
            None
        };
        if let Some(e) = handshake_error {
            let msg = e.to_string();
            self.report_handshake_error(Some(&connection), e);
            self.drop_connection(generation).await;
            return Err(TransportError::ConnectionLost(msg));
        }

        if let Err(e) = connection.send(self.message_factory.create_ack(&syn_ack.connection_id)).await {
            self.drop_connection(generation).await;
            return Err(TransportError::ConnectionLost(e.to_string()));
        }

        {
            let mut state = self.state.lock();
            if state.status == TransportStatus::Closed {
                return Err(TransportError::Closed);
            }
            if state.generation != generation {
                return Err(TransportError::ConnectionLost("connection lost after handshake".to_string()));
            }
            state.connection_id = syn_ack.connection_id.clone();
            state.peer_callback_port = syn_ack.callback_port;
            self.set_status(&mut state, TransportStatus::Connected);
        }

        info!("connected as {} on connection #{}", syn_ack.connection_id, connection.connection_number());
        self.fire(vec![TransportEvent::Connected(syn_ack.connection_id)]);
        Ok(())
    }

    pub(crate) async fn on_client_handshake_message(&self, generation: u64, msg: TransportHandshakeMessage) {
        match msg {
            TransportHandshakeMessage::SynAck(syn_ack) => {
                let pending = {
                    let mut state = self.state.lock();
                    if state.generation == generation {
                        state.pending_handshake.take()
                    }
                    else {
                        None
                    }
                };
                match pending {
                    Some(pending) => {
                        let _ = pending.send(syn_ack);
                    }
                    None => {
                        let e = self.unexpected_handshake_message(&TransportHandshakeMessage::SynAck(syn_ack));
                        self.handshake_failed(generation, e).await;
                    }
                }
            }
            other => {
                let e = self.unexpected_handshake_message(&other);
                self.handshake_failed(generation, e).await;
            }
        }
    }

    pub(crate) fn spawn_reconnect(&self) {
        let transport = match self.myself.upgrade() {
            Some(t) => t,
            None => return,
        };

        tokio::spawn(async move {
            let establisher = match transport.establisher() {
                Some(e) => e,
                None => return,
            };

            match establisher.establish(&transport, EstablishMode::Reconnect).await {
                Ok(()) => info!("reconnected {}", transport.connection_id()),
                Err(TransportError::Closed) => debug!("reconnect of {} cancelled", transport.connection_id()),
                Err(e) => {
                    warn!("giving up reconnecting {}: {}", transport.connection_id(), e);
                    transport.close().await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time;

    use crate::config::{BackoffConfig, RetryBudget, TransportConfig};
    use crate::connection::{CloseReason, Connection};
    use crate::connection_id::ConnectionId;
    use crate::error::{HandshakeError, TransportError};
    use crate::test_util::{client_transport, client_transport_with_handler, test_config, EventCollector, FakeConnectionFactory, InMemoryNetwork, RecordingHandshakeErrorHandler, TestServer};
    use crate::transport::transport_events::TransportEvent;
    use crate::transport::TransportStatus;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_open_connects() {
        let network = InMemoryNetwork::new();
        let server = TestServer::start(&network, addr("10.0.0.1:9510"), test_config()).await;

        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        let events = EventCollector::register(&transport);

        let id = transport.open().await.unwrap();
        assert!(!id.is_null());
        assert_eq!(transport.connection_id(), id);
        assert_eq!(transport.status(), TransportStatus::Connected);
        assert!(transport.is_open());
        assert_eq!(events.events(), vec![
            TransportEvent::ConnectAttempt(ConnectionId::NULL_ID),
            TransportEvent::Connected(id.clone()),
        ]);

        server.wait_for_stacks(1).await;
    }

    #[tokio::test]
    #[should_panic(expected = "open() was called twice")]
    async fn test_double_open_after_success_panics() {
        let network = InMemoryNetwork::new();
        let _server = TestServer::start(&network, addr("10.0.0.1:9510"), test_config()).await;

        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        transport.open().await.unwrap();
        let _ = transport.open().await;
    }

    #[tokio::test]
    #[should_panic(expected = "open() was called twice")]
    async fn test_double_open_after_failure_panics() {
        let network = InMemoryNetwork::new();
        let config = TransportConfig {
            max_reconnect_tries: RetryBudget::Limited(0),
            ..test_config()
        };
        let transport = client_transport(&network, config, vec![addr("10.0.0.1:9510")]);
        assert!(transport.open().await.is_err());
        let _ = transport.open().await;
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let network = InMemoryNetwork::new();
        let _server = TestServer::start(&network, addr("10.0.0.1:9510"), test_config()).await;

        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        let events = EventCollector::register(&transport);
        transport.open().await.unwrap();

        transport.close().await;
        transport.close().await;
        assert_eq!(transport.status(), TransportStatus::Closed);
        assert_eq!(events.count(|e| matches!(e, TransportEvent::Closed(_))), 1);
        assert_eq!(transport.send(crate::wire::WireProtocolMessage::application(bytes::Bytes::from_static(b"x"))).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_open_after_close() {
        let network = InMemoryNetwork::new();
        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        transport.close().await;
        assert_eq!(transport.open().await, Err(TransportError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_retries_exhausted() {
        let network = InMemoryNetwork::new();
        let config = TransportConfig {
            max_reconnect_tries: RetryBudget::Limited(3),
            reconnect_backoff: BackoffConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(100),
                factor_eighths: 8,
            },
            ..test_config()
        };
        let transport = client_transport(&network, config, vec![addr("10.0.0.1:9510")]);
        let events = EventCollector::register(&transport);

        assert_eq!(transport.open().await, Err(TransportError::ReconnectTriesExhausted { attempts: 3 }));
        assert_eq!(transport.status(), TransportStatus::Closed);
        assert_eq!(events.count(|e| matches!(e, TransportEvent::ConnectAttempt(_))), 3);
    }

    #[tokio::test]
    async fn test_open_rejected_when_server_full() {
        let network = InMemoryNetwork::new();
        let server_config = TransportConfig {
            max_connections: 1,
            ..test_config()
        };
        let _server = TestServer::start(&network, addr("10.0.0.1:9510"), server_config).await;

        let first = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        first.open().await.unwrap();

        let second = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        match second.open().await {
            Err(TransportError::Rejected { max_connections_exceeded, max_connections, .. }) => {
                assert!(max_connections_exceeded);
                assert_eq!(max_connections, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(second.status(), TransportStatus::Closed);
    }

    #[tokio::test]
    async fn test_rejection_is_reported_to_handshake_error_handler() {
        let network = InMemoryNetwork::new();
        let server_config = TransportConfig {
            max_connections: 1,
            ..test_config()
        };
        let _server = TestServer::start(&network, addr("10.0.0.1:9510"), server_config).await;

        let first = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        first.open().await.unwrap();

        let handler = Arc::new(RecordingHandshakeErrorHandler::default());
        let second = client_transport_with_handler(network.clone(), test_config(), vec![addr("10.0.0.1:9510")], handler.clone());
        assert!(matches!(second.open().await, Err(TransportError::Rejected { .. })));

        let errors = handler.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].error, HandshakeError::RejectedByServer(_)));
        assert_eq!(errors[0].peer_addr, Some(addr("10.0.0.1:9510")));
    }

    #[tokio::test]
    async fn test_close_during_handshake_is_reported_to_handshake_error_handler() {
        let (factory, mut connections) = FakeConnectionFactory::new();
        let handler = Arc::new(RecordingHandshakeErrorHandler::default());
        let config = TransportConfig {
            max_reconnect_tries: RetryBudget::Limited(1),
            ..test_config()
        };
        let transport = client_transport_with_handler(factory, config, vec![addr("10.0.0.1:9510")], handler.clone());

        let t = transport.clone();
        let open = tokio::spawn(async move { t.open().await });

        let fake = connections.recv().await.unwrap();
        fake.wait_for_sent(|_| true).await;
        fake.inject_close(CloseReason::EndOfStream).await;

        let result = time::timeout(Duration::from_secs(5), open).await.unwrap().unwrap();
        assert!(result.is_err());
        assert_eq!(transport.status(), TransportStatus::Closed);

        handler.wait_for_errors(1).await;
        let errors = handler.errors();
        assert_eq!(errors[0].error, HandshakeError::ConnectionClosed);
        assert_eq!(errors[0].connection_number, fake.connection_number());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_open() {
        let network = InMemoryNetwork::new();
        let config = TransportConfig {
            max_reconnect_tries: RetryBudget::Unbounded,
            reconnect_backoff: BackoffConfig {
                initial_delay: Duration::from_secs(3600),
                max_delay: Duration::from_secs(3600),
                factor_eighths: 8,
            },
            ..test_config()
        };
        let transport = client_transport(&network, config, vec![addr("10.0.0.1:9510")]);

        let t = transport.clone();
        let open = tokio::spawn(async move { t.open().await });
        time::sleep(Duration::from_millis(10)).await;
        transport.close().await;

        let result = time::timeout(Duration::from_secs(1), open).await.unwrap().unwrap();
        assert_eq!(result, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_reconnect_preserves_identity() {
        let network = InMemoryNetwork::new();
        let server = TestServer::start(&network, addr("10.0.0.1:9510"), test_config()).await;

        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        let events = EventCollector::register(&transport);
        let id = transport.open().await.unwrap();
        server.wait_for_stacks(1).await;
        let harness_before = server.provider.get_stack(&id).unwrap();

        network.break_connections(addr("10.0.0.1:9510")).await;

        events.wait_for(|e| matches!(e, TransportEvent::Disconnected { .. })).await;
        events.wait_for_count(|e| matches!(e, TransportEvent::Connected(_)), 2).await;

        assert_eq!(transport.connection_id(), id);
        assert_eq!(transport.status(), TransportStatus::Connected);

        let harness_after = server.provider.get_stack(&id).unwrap();
        assert!(Arc::ptr_eq(&harness_before, &harness_after));
        assert_eq!(server.provider.stack_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_server_is_back() {
        let network = InMemoryNetwork::new();
        let server = TestServer::start(&network, addr("10.0.0.1:9510"), test_config()).await;

        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510")]);
        let events = EventCollector::register(&transport);
        let id = transport.open().await.unwrap();
        server.wait_for_stacks(1).await;

        network.unbind(addr("10.0.0.1:9510"));
        network.break_connections(addr("10.0.0.1:9510")).await;

        // the initial attempt plus at least one refused reconnect
        events.wait_for_count(|e| matches!(e, TransportEvent::ConnectAttempt(_)), 3).await;
        assert_eq!(transport.status(), TransportStatus::Reconnecting);

        network.bind(addr("10.0.0.1:9510"), server.acceptor.clone());
        events.wait_for_count(|e| matches!(e, TransportEvent::Connected(_)), 2).await;
        assert_eq!(transport.connection_id(), id);
        assert_eq!(server.provider.stack_count(), 1);
    }

    #[tokio::test]
    async fn test_failover_to_second_address() {
        let network = InMemoryNetwork::new();
        let server = TestServer::start(&network, addr("10.0.0.2:9510"), test_config()).await;

        let transport = client_transport(&network, test_config(), vec![addr("10.0.0.1:9510"), addr("10.0.0.2:9510")]);
        let id = transport.open().await.unwrap();
        server.wait_for_stacks(1).await;
        assert!(server.provider.get_stack(&id).is_some());
    }

    #[tokio::test]
    async fn test_no_reconnect_closes() {
        let network = InMemoryNetwork::new();
        let _server = TestServer::start(&network, addr("10.0.0.1:9510"), test_config()).await;

        let config = TransportConfig {
            max_reconnect_tries: RetryBudget::Limited(0),
            ..test_config()
        };
        let transport = client_transport(&network, config, vec![addr("10.0.0.1:9510")]);
        let events = EventCollector::register(&transport);
        transport.open().await.unwrap();

        network.break_connections(addr("10.0.0.1:9510")).await;
        events.wait_for(|e| matches!(e, TransportEvent::Closed(_))).await;
        assert_eq!(transport.status(), TransportStatus::Closed);
        assert_eq!(events.count(|e| matches!(e, TransportEvent::Disconnected { forced: false, .. })), 1);
    }
}
