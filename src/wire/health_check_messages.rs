use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::wire::wire_message::{ProtocolType, WireProtocolMessage};

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum HealthCheckKind {
    Ping = 1,
    PingReply = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HealthCheckMessage {
    Ping { seq: u64 },
    PingReply { seq: u64 },
}

impl HealthCheckMessage {
    pub fn ser(&self, buf: &mut impl BufMut) {
        match self {
            HealthCheckMessage::Ping { seq } => {
                buf.put_u8(HealthCheckKind::Ping.into());
                buf.put_u64(*seq);
            }
            HealthCheckMessage::PingReply { seq } => {
                buf.put_u8(HealthCheckKind::PingReply.into());
                buf.put_u64(*seq);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<HealthCheckMessage> {
        let kind = HealthCheckKind::try_from(buf.try_get_u8()?)?;
        let seq = buf.try_get_u64()?;
        if buf.has_remaining() {
            bail!("{} trailing bytes after health check message", buf.remaining());
        }

        Ok(match kind {
            HealthCheckKind::Ping => HealthCheckMessage::Ping { seq },
            HealthCheckKind::PingReply => HealthCheckMessage::PingReply { seq },
        })
    }

    /// the reply a peer sends when it receives this message, if any
    pub fn create_response(&self) -> Option<HealthCheckMessage> {
        match self {
            HealthCheckMessage::Ping { seq } => Some(HealthCheckMessage::PingReply { seq: *seq }),
            HealthCheckMessage::PingReply { .. } => None,
        }
    }

    pub fn to_wire_message(&self) -> WireProtocolMessage {
        let mut buf = BytesMut::with_capacity(9);
        self.ser(&mut buf);
        WireProtocolMessage::new(ProtocolType::HealthCheck, buf.freeze())
    }
}
