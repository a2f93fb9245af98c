use std::net::SocketAddr;

use tracing::warn;

use crate::connection_id::ConnectionId;
use crate::error::HandshakeError;

/// Everything known about a handshake problem at the point where it was detected
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeErrorContext {
    pub connection_number: u64,
    pub peer_addr: Option<SocketAddr>,
    /// the local side's view of the connection id at the time of the error
    pub connection_id: ConnectionId,
    pub error: HandshakeError,
}

/// All handshake problems on both client and server side are reported here. The transport
///  itself closes the affected connection; the handler is for logging and statistics.
pub trait TransportHandshakeErrorHandler: Send + Sync + 'static {
    fn handle_handshake_error(&self, context: &HandshakeErrorContext);
}

pub struct LoggingHandshakeErrorHandler {}

impl TransportHandshakeErrorHandler for LoggingHandshakeErrorHandler {
    fn handle_handshake_error(&self, context: &HandshakeErrorContext) {
        warn!("handshake error on connection #{} from {:?} ({}): {}", context.connection_number, context.peer_addr, context.connection_id, context.error);
    }
}
