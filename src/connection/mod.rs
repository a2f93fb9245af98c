pub mod stream_connection;

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

use crate::error::FramingError;
use crate::wire::WireProtocolMessage;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// the peer closed its end of the stream at a frame boundary
    EndOfStream,
    LocalClose,
    IoError(String),
    Framing(FramingError),
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Message(WireProtocolMessage),
    /// always the last event of a connection, sent exactly once
    Closed(CloseReason),
}

/// A single physical, bidirectional byte stream carrying framed messages. Transports own a
///  connection through this abstraction, allowing them to be tested without sockets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// process-wide unique number, for logging
    fn connection_number(&self) -> u64;

    fn peer_addr(&self) -> Option<SocketAddr>;

    async fn send(&self, message: WireProtocolMessage) -> anyhow::Result<()>;

    /// sends several messages as a single group frame
    async fn send_batch(&self, messages: Vec<WireProtocolMessage>) -> anyhow::Result<()>;

    /// Closes the connection; idempotent. The connection's event stream ends with
    ///  [CloseReason::LocalClose] unless it was closed for a different reason before.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A connection together with the stream of events received on it. The events are consumed by
///  exactly one owner at a time, while the connection may be shared for sending.
pub struct PhysicalConnection {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

impl Debug for PhysicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PhysicalConnection(#{} {:?})", self.connection.connection_number(), self.connection.peer_addr())
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<PhysicalConnection>;
}

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn next_connection_number() -> u64 {
    CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}
