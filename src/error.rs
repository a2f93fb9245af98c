use thiserror::Error;

use crate::connection_id::ConnectionId;

/// A frame that failed validation. The connection it was read from can not be trusted any more
///  and is closed; the error never escapes the connection it occurred on.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum FramingError {
    #[error("frame is too short: {len} bytes")]
    TooShort { len: usize },
    #[error("unsupported wire protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown protocol type {0}")]
    UnknownProtocol(u8),
    #[error("declared frame length {declared} does not match actual length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("frame length {len} exceeds the maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("checksum mismatch: declared {declared:08x}, actual {actual:08x}")]
    ChecksumMismatch { declared: u32, actual: u32 },
    #[error("declared message count {declared} does not match frame contents ({actual})")]
    MessageCountMismatch { declared: usize, actual: usize },
    #[error("malformed group frame: {0}")]
    MalformedGroup(String),
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("invalid connection id {input:?}: {reason}")]
pub struct InvalidConnectionId {
    pub input: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("no network stack for connection id {connection_id}")]
pub struct StackNotFound {
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum AttachError {
    #[error(transparent)]
    StackNotFound(#[from] StackNotFound),
    #[error("maximum number of connections ({max_connections}) exceeded")]
    MaxConnectionsExceeded { max_connections: i32 },
}

/// Problems with handshake messages: these are reported through a
///  [crate::transport::handshake_error::TransportHandshakeErrorHandler] and lead to the connection
///  being closed (and, client side, retried), but they are never returned to application code.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum HandshakeError {
    #[error("malformed handshake message: {0}")]
    Malformed(String),
    #[error("unexpected {kind} handshake message in status {status}")]
    UnexpectedMessage { kind: &'static str, status: &'static str },
    #[error("stack layer mismatch: peer declared {peer:#04x}, local stack is {local:#04x}")]
    StackLayerMismatch { peer: u8, local: u8 },
    #[error("server assigned connection id {assigned} while {expected} was requested")]
    ConnectionIdMismatch { expected: ConnectionId, assigned: ConnectionId },
    #[error("no handshake within {millis}ms")]
    Timeout { millis: u128 },
    #[error("expected a handshake message, received {0}")]
    NotAHandshake(String),
    #[error("connection closed during handshake")]
    ConnectionClosed,
    #[error("handshake rejected: {0}")]
    Rejected(#[from] AttachError),
    #[error("server rejected the connection: {0}")]
    RejectedByServer(String),
}

/// Everything a transport reports to application code. I/O errors are normalized into these.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport was closed")]
    Closed,
    #[error("connection rejected by server: {reason}")]
    Rejected {
        reason: String,
        max_connections_exceeded: bool,
        max_connections: i32,
    },
    #[error("giving up after {attempts} connect attempts")]
    ReconnectTriesExhausted { attempts: u32 },
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("message frame of {len} bytes exceeds the maximum frame size of {max}")]
    MessageTooLarge { len: usize, max: usize },
}

impl TransportError {
    /// Permanent failures end a connect loop, everything else is worth another attempt
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Rejected { .. } | TransportError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum ReadFrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
}
