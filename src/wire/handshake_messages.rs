use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connection_id::ConnectionId;
use crate::error::HandshakeError;
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::wire::wire_message::{ProtocolType, WireProtocolMessage};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum HandshakeKind {
    Syn = 1,
    SynAck = 2,
    Ack = 3,
}

/// Client -> server: the id the client wants to continue (or [ConnectionId::NULL_ID] for a new
///  session)
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SynMessage {
    pub connection_id: ConnectionId,
    pub stack_layer_flags: u8,
    pub callback_port: Option<u16>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeRejection {
    pub reason: String,
    pub max_connections_exceeded: bool,
    pub max_connections: i32,
}

/// Server -> client: the id assigned by the server, and whether the connection was accepted
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SynAckMessage {
    pub connection_id: ConnectionId,
    pub callback_port: Option<u16>,
    pub rejection: Option<HandshakeRejection>,
}

impl SynAckMessage {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AckMessage {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportHandshakeMessage {
    Syn(SynMessage),
    SynAck(SynAckMessage),
    Ack(AckMessage),
}

impl TransportHandshakeMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TransportHandshakeMessage::Syn(_) => "SYN",
            TransportHandshakeMessage::SynAck(_) => "SYN_ACK",
            TransportHandshakeMessage::Ack(_) => "ACK",
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            TransportHandshakeMessage::Syn(m) => &m.connection_id,
            TransportHandshakeMessage::SynAck(m) => &m.connection_id,
            TransportHandshakeMessage::Ack(m) => &m.connection_id,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            TransportHandshakeMessage::Syn(m) => {
                buf.put_u8(HandshakeKind::Syn.into());
                m.connection_id.ser(buf);
                buf.put_u8(m.stack_layer_flags);
                buf.put_u16(m.callback_port.unwrap_or(0));
            }
            TransportHandshakeMessage::SynAck(m) => {
                buf.put_u8(HandshakeKind::SynAck.into());
                m.connection_id.ser(buf);
                buf.put_u16(m.callback_port.unwrap_or(0));
                match &m.rejection {
                    None => buf.put_bool(true),
                    Some(rejection) => {
                        buf.put_bool(false);
                        buf.put_bool(rejection.max_connections_exceeded);
                        buf.put_i32(rejection.max_connections);
                        buf.put_string(&rejection.reason);
                    }
                }
            }
            TransportHandshakeMessage::Ack(m) => {
                buf.put_u8(HandshakeKind::Ack.into());
                m.connection_id.ser(buf);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<TransportHandshakeMessage, HandshakeError> {
        let result = Self::_try_deser(buf)
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        if buf.has_remaining() {
            return Err(HandshakeError::Malformed(format!("{} trailing bytes after {} message", buf.remaining(), result.kind_name())));
        }
        Ok(result)
    }

    fn _try_deser(buf: &mut impl Buf) -> anyhow::Result<TransportHandshakeMessage> {
        let kind = HandshakeKind::try_from(buf.try_get_u8()?)?;
        let connection_id = ConnectionId::try_deser(buf)?;

        match kind {
            HandshakeKind::Syn => {
                let stack_layer_flags = buf.try_get_u8()?;
                let callback_port = port_from_wire(buf.try_get_u16()?);
                Ok(TransportHandshakeMessage::Syn(SynMessage {
                    connection_id,
                    stack_layer_flags,
                    callback_port,
                }))
            }
            HandshakeKind::SynAck => {
                let callback_port = port_from_wire(buf.try_get_u16()?);
                let rejection = if buf.try_get_bool()? {
                    None
                }
                else {
                    let max_connections_exceeded = buf.try_get_bool()?;
                    let max_connections = buf.try_get_i32()?;
                    let reason = buf.try_get_string()?;
                    Some(HandshakeRejection {
                        reason,
                        max_connections_exceeded,
                        max_connections,
                    })
                };
                Ok(TransportHandshakeMessage::SynAck(SynAckMessage {
                    connection_id,
                    callback_port,
                    rejection,
                }))
            }
            HandshakeKind::Ack => Ok(TransportHandshakeMessage::Ack(AckMessage { connection_id })),
        }
    }

    pub fn to_wire_message(&self) -> WireProtocolMessage {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        WireProtocolMessage::new(ProtocolType::TransportHandshake, buf.freeze())
    }

    pub fn from_wire_message(msg: &WireProtocolMessage) -> Result<TransportHandshakeMessage, HandshakeError> {
        if msg.protocol != ProtocolType::TransportHandshake {
            return Err(HandshakeError::NotAHandshake(format!("{:?}", msg.protocol)));
        }
        Self::try_deser(&mut msg.payload.clone())
    }
}

fn port_from_wire(port: u16) -> Option<u16> {
    match port {
        0 => None,
        p => Some(p),
    }
}
