use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::{FramingError, ReadFrameError};

pub const WIRE_PROTOCOL_VERSION: u8 = 1;

const CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolType {
    /// opaque payload of the layer above the transport
    Application = 1,
    TransportHandshake = 2,
    /// control frames of the once-and-only-once delivery layer; passed upward untouched
    ReliableDelivery = 3,
    HealthCheck = 4,
    /// several messages batched into a single frame
    Group = 5,
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u32);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x?}", self.0)
    }
}
impl Checksum {
    /// covers the header (with the checksum field zeroed) and the payload
    fn new(header_prefix: &[u8], payload: &[u8]) -> Checksum {
        let mut digest = CRC.digest();
        digest.update(header_prefix);
        digest.update(&[0u8; 4]);
        digest.update(payload);
        Checksum(digest.finalize())
    }
}

/// Fixed size frame header, all numbers in network byte order:
///
/// ```ascii
/// 0: version (u8)
/// 1: protocol type (u8)
/// 2: message count (u16)
/// 4: total frame length including the header (u32)
/// 8: CRC-32 checksum (u32)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WireProtocolHeader {
    pub version: u8,
    pub protocol: ProtocolType,
    pub message_count: u16,
    pub total_length: u32,
    pub checksum: Checksum,
}

impl WireProtocolHeader {
    pub const SERIALIZED_LEN: usize = 12;
    const OFFS_CHECKSUM: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.protocol.into());
        buf.put_u16(self.message_count);
        buf.put_u32(self.total_length);
        buf.put_u32(self.checksum.0);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<WireProtocolHeader, FramingError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(FramingError::TooShort { len: buf.remaining() });
        }

        let version = buf.get_u8();
        if version != WIRE_PROTOCOL_VERSION {
            return Err(FramingError::UnsupportedVersion(version));
        }
        let raw_protocol = buf.get_u8();
        let protocol = ProtocolType::try_from(raw_protocol)
            .map_err(|_| FramingError::UnknownProtocol(raw_protocol))?;

        Ok(WireProtocolHeader {
            version,
            protocol,
            message_count: buf.get_u16(),
            total_length: buf.get_u32(),
            checksum: Checksum(buf.get_u32()),
        })
    }
}

/// A single logical message: a protocol type and its payload. Several messages can share a
///  single frame, see [WireProtocolMessage::encode_group].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WireProtocolMessage {
    pub protocol: ProtocolType,
    pub payload: Bytes,
}

impl WireProtocolMessage {
    const GROUP_ENTRY_OVERHEAD: usize = size_of::<u8>() + size_of::<u32>();

    pub fn new(protocol: ProtocolType, payload: Bytes) -> WireProtocolMessage {
        assert_ne!(protocol, ProtocolType::Group, "group frames are created by encode_group");
        WireProtocolMessage {
            protocol,
            payload,
        }
    }

    pub fn application(payload: Bytes) -> WireProtocolMessage {
        Self::new(ProtocolType::Application, payload)
    }

    pub fn encode(&self) -> Bytes {
        Self::encode_frame(self.protocol, 1, &self.payload)
    }

    /// the length of this message's frame when it is sent on its own
    pub fn frame_len(&self) -> usize {
        WireProtocolHeader::SERIALIZED_LEN + self.payload.len()
    }

    /// Encodes a batch of messages in as few frames as possible, preserving their order. A group
    ///  frame holds at most `u16::MAX` messages and does not exceed `max_frame_size`; a message
    ///  that exceeds it on its own still gets a frame of its own.
    pub fn encode_batch(messages: &[WireProtocolMessage], max_frame_size: u32) -> Vec<Bytes> {
        let max_frame_size = max_frame_size as usize;

        let mut frames = Vec::new();
        let mut start = 0;
        let mut group_len = WireProtocolHeader::SERIALIZED_LEN;
        for (i, msg) in messages.iter().enumerate() {
            let entry_len = Self::GROUP_ENTRY_OVERHEAD + msg.payload.len();
            let count = i - start;
            if count > 0 && (count == u16::MAX as usize || group_len + entry_len > max_frame_size) {
                frames.push(Self::encode_group(&messages[start..i]));
                start = i;
                group_len = WireProtocolHeader::SERIALIZED_LEN;
            }
            group_len += entry_len;
        }
        if start < messages.len() {
            frames.push(Self::encode_group(&messages[start..]));
        }
        frames
    }

    /// Batches messages into a single frame. Decoding it yields the messages in the same order.
    ///  Callers with an unbounded number of messages use [WireProtocolMessage::encode_batch].
    pub fn encode_group(messages: &[WireProtocolMessage]) -> Bytes {
        assert!(!messages.is_empty(), "empty group");
        assert!(messages.len() <= u16::MAX as usize, "too many messages for a single group");

        if let [single] = messages {
            return single.encode();
        }

        let payload_len = messages.iter()
            .map(|m| Self::GROUP_ENTRY_OVERHEAD + m.payload.len())
            .sum();
        let mut payload = BytesMut::with_capacity(payload_len);
        for msg in messages {
            payload.put_u8(msg.protocol.into());
            payload.put_u32(msg.payload.len() as u32);
            payload.put_slice(&msg.payload);
        }

        Self::encode_frame(ProtocolType::Group, messages.len() as u16, &payload)
    }

    fn encode_frame(protocol: ProtocolType, message_count: u16, payload: &[u8]) -> Bytes {
        let total_length = WireProtocolHeader::SERIALIZED_LEN + payload.len();
        assert!(total_length <= u32::MAX as usize, "payload too large for a single frame");

        let mut buf = BytesMut::with_capacity(total_length);
        WireProtocolHeader {
            version: WIRE_PROTOCOL_VERSION,
            protocol,
            message_count,
            total_length: total_length as u32,
            checksum: Checksum(0),
        }.ser(&mut buf);
        buf.put_slice(payload);

        let checksum = Checksum::new(&buf[..WireProtocolHeader::OFFS_CHECKSUM], payload);
        buf[WireProtocolHeader::OFFS_CHECKSUM..WireProtocolHeader::SERIALIZED_LEN]
            .copy_from_slice(&checksum.0.to_be_bytes());
        buf.freeze()
    }

    /// Validates a complete frame and splits it into its messages. Nothing of a frame that fails
    ///  validation is returned.
    pub fn decode(frame: &Bytes, max_frame_size: u32) -> Result<Vec<WireProtocolMessage>, FramingError> {
        let header = WireProtocolHeader::try_deser(&mut &frame[..])?;

        if header.total_length > max_frame_size {
            return Err(FramingError::FrameTooLarge { len: header.total_length as usize, max: max_frame_size as usize });
        }
        if header.total_length as usize != frame.len() {
            return Err(FramingError::LengthMismatch { declared: header.total_length as usize, actual: frame.len() });
        }

        let payload = frame.slice(WireProtocolHeader::SERIALIZED_LEN..);
        let actual = Checksum::new(&frame[..WireProtocolHeader::OFFS_CHECKSUM], &payload);
        if actual != header.checksum {
            return Err(FramingError::ChecksumMismatch { declared: header.checksum.0, actual: actual.0 });
        }

        if header.protocol != ProtocolType::Group {
            if header.message_count != 1 {
                return Err(FramingError::MessageCountMismatch { declared: header.message_count as usize, actual: 1 });
            }
            return Ok(vec![WireProtocolMessage {
                protocol: header.protocol,
                payload,
            }]);
        }

        let messages = Self::split_group(payload)?;
        if messages.len() != header.message_count as usize {
            return Err(FramingError::MessageCountMismatch { declared: header.message_count as usize, actual: messages.len() });
        }
        Ok(messages)
    }

    fn split_group(mut payload: Bytes) -> Result<Vec<WireProtocolMessage>, FramingError> {
        let mut result = Vec::new();
        while payload.has_remaining() {
            if payload.remaining() < Self::GROUP_ENTRY_OVERHEAD {
                return Err(FramingError::MalformedGroup(format!("truncated entry header ({} bytes)", payload.remaining())));
            }
            let raw_protocol = payload.get_u8();
            let protocol = match ProtocolType::try_from(raw_protocol) {
                Ok(ProtocolType::Group) => return Err(FramingError::MalformedGroup("nested group".to_string())),
                Ok(p) => p,
                Err(_) => return Err(FramingError::UnknownProtocol(raw_protocol)),
            };
            let len = payload.get_u32() as usize;
            if payload.remaining() < len {
                return Err(FramingError::MalformedGroup(format!("entry of length {} with only {} bytes remaining", len, payload.remaining())));
            }
            result.push(WireProtocolMessage {
                protocol,
                payload: payload.split_to(len),
            });
        }

        if result.is_empty() {
            return Err(FramingError::MalformedGroup("empty group".to_string()));
        }
        Ok(result)
    }
}

/// Reads the next frame from a byte stream. Returns `None` if the stream ended cleanly at a
///  frame boundary.
pub async fn read_frame(reader: &mut (impl AsyncRead + Unpin), max_frame_size: u32) -> Result<Option<Vec<WireProtocolMessage>>, ReadFrameError> {
    let mut header_buf = [0u8; WireProtocolHeader::SERIALIZED_LEN];
    let n = reader.read(&mut header_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header_buf[n..]).await?;

    let header = WireProtocolHeader::try_deser(&mut &header_buf[..])?;
    if header.total_length > max_frame_size {
        return Err(FramingError::FrameTooLarge { len: header.total_length as usize, max: max_frame_size as usize }.into());
    }
    if (header.total_length as usize) < WireProtocolHeader::SERIALIZED_LEN {
        return Err(FramingError::TooShort { len: header.total_length as usize }.into());
    }

    let mut frame = BytesMut::zeroed(header.total_length as usize);
    frame[..WireProtocolHeader::SERIALIZED_LEN].copy_from_slice(&header_buf);
    reader.read_exact(&mut frame[WireProtocolHeader::SERIALIZED_LEN..]).await?;

    trace!("read frame {:?}", header);
    Ok(Some(WireProtocolMessage::decode(&frame.freeze(), max_frame_size)?))
}
