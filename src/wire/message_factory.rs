use crate::config::TransportConfig;
use crate::connection_id::ConnectionId;
use crate::wire::handshake_messages::{AckMessage, HandshakeRejection, SynAckMessage, SynMessage, TransportHandshakeMessage};
use crate::wire::health_check_messages::HealthCheckMessage;
use crate::wire::wire_message::WireProtocolMessage;

/// Creates the transport's own messages with the locally configured stack layering and callback
///  port filled in
#[derive(Debug, Clone)]
pub struct TransportMessageFactory {
    stack_layer_flags: u8,
    callback_port: Option<u16>,
}

impl TransportMessageFactory {
    pub fn new(config: &TransportConfig) -> TransportMessageFactory {
        TransportMessageFactory {
            stack_layer_flags: config.stack_layer_flags,
            callback_port: config.callback_port,
        }
    }

    pub fn stack_layer_flags(&self) -> u8 {
        self.stack_layer_flags
    }

    pub fn create_syn(&self, connection_id: &ConnectionId) -> WireProtocolMessage {
        TransportHandshakeMessage::Syn(SynMessage {
            connection_id: connection_id.clone(),
            stack_layer_flags: self.stack_layer_flags,
            callback_port: self.callback_port,
        }).to_wire_message()
    }

    pub fn create_syn_ack(&self, connection_id: &ConnectionId) -> WireProtocolMessage {
        TransportHandshakeMessage::SynAck(SynAckMessage {
            connection_id: connection_id.clone(),
            callback_port: self.callback_port,
            rejection: None,
        }).to_wire_message()
    }

    pub fn create_syn_ack_reject(&self, connection_id: &ConnectionId, reason: &str, max_connections_exceeded: bool, max_connections: i32) -> WireProtocolMessage {
        TransportHandshakeMessage::SynAck(SynAckMessage {
            connection_id: connection_id.clone(),
            callback_port: None,
            rejection: Some(HandshakeRejection {
                reason: reason.to_string(),
                max_connections_exceeded,
                max_connections,
            }),
        }).to_wire_message()
    }

    pub fn create_ack(&self, connection_id: &ConnectionId) -> WireProtocolMessage {
        TransportHandshakeMessage::Ack(AckMessage {
            connection_id: connection_id.clone(),
        }).to_wire_message()
    }

    pub fn create_ping(&self, seq: u64) -> WireProtocolMessage {
        HealthCheckMessage::Ping { seq }.to_wire_message()
    }

    pub fn create_ping_response(&self, ping: &HealthCheckMessage) -> Option<WireProtocolMessage> {
        ping.create_response()
            .map(|reply| reply.to_wire_message())
    }
}
