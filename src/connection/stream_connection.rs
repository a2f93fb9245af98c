use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::connection::{next_connection_number, CloseReason, Connection, ConnectionEvent, ConnectionFactory, PhysicalConnection};
use crate::error::ReadFrameError;
use crate::wire::{read_frame, WireProtocolMessage};

/// A [Connection] on top of any async byte stream: a TCP socket in production, an in-memory
///  duplex stream in tests.
///
/// A reader task decodes incoming frames and forwards their messages as [ConnectionEvent]s.
///  Writes are serialized through a lock so frames of concurrent senders never interleave.
///
/// Closing never waits for pending writes: a peer that stops reading stalls writers once the
///  send buffer is full, and closing cancels them.
pub struct StreamConnection<S: AsyncRead + AsyncWrite + Send + 'static> {
    connection_number: u64,
    peer_addr: Option<SocketAddr>,
    writer: tokio::sync::Mutex<Option<WriteHalf<S>>>,
    max_frame_size: u32,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl <S: AsyncRead + AsyncWrite + Send + 'static> StreamConnection<S> {
    pub fn spawn(stream: S, peer_addr: Option<SocketAddr>, config: &TransportConfig) -> PhysicalConnection {
        let (reader, writer) = tokio::io::split(stream);
        let (events_send, events_recv) = mpsc::channel(config.connection_event_queue_size);

        let connection = Arc::new(StreamConnection {
            connection_number: next_connection_number(),
            peer_addr,
            writer: tokio::sync::Mutex::new(Some(writer)),
            max_frame_size: config.max_frame_size,
            closed: AtomicBool::new(false),
            close_signal: watch::channel(false).0,
            reader_task: parking_lot::Mutex::new(None),
            events: events_send.clone(),
        });
        debug!("opened connection #{} to {:?}", connection.connection_number, peer_addr);

        let handle = tokio::spawn(Self::receive_loop(reader, config.max_frame_size, events_send, Arc::downgrade(&connection)));
        *connection.reader_task.lock() = Some(handle);

        PhysicalConnection {
            connection,
            events: events_recv,
        }
    }

    async fn receive_loop(mut reader: ReadHalf<S>, max_frame_size: u32, events: mpsc::Sender<ConnectionEvent>, connection: Weak<StreamConnection<S>>) {
        let reason = 'receive: loop {
            match read_frame(&mut reader, max_frame_size).await {
                Ok(Some(messages)) => {
                    for msg in messages {
                        if events.send(ConnectionEvent::Message(msg)).await.is_err() {
                            trace!("event receiver was dropped - terminating receive loop");
                            break 'receive CloseReason::LocalClose;
                        }
                    }
                }
                Ok(None) => break CloseReason::EndOfStream,
                Err(ReadFrameError::Io(e)) => break CloseReason::IoError(e.to_string()),
                Err(ReadFrameError::Framing(e)) => {
                    warn!("received invalid frame, closing connection: {}", e);
                    break CloseReason::Framing(e);
                }
            }
        };

        if let Some(connection) = connection.upgrade() {
            connection.close_with(reason).await;
        }
    }

    async fn close_with(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing connection #{}: {:?}", self.connection_number, reason);
        self.close_signal.send_replace(true);

        // a busy writer is cancelled by the close signal and discards the write half itself
        if let Some(mut writer) = self.take_idle_writer() {
            let _ = writer.shutdown().await;
        }

        if reason == CloseReason::LocalClose {
            // the closing side does not necessarily drain events any more
            let _ = self.events.try_send(ConnectionEvent::Closed(reason));
        }
        else {
            let _ = self.events.send(ConnectionEvent::Closed(reason)).await;
        }
    }

    fn take_idle_writer(&self) -> Option<WriteHalf<S>> {
        self.writer.try_lock().ok()
            .and_then(|mut writer| writer.take())
    }

    async fn write_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("connection #{} is closed", self.connection_number);
        }
        if frame.len() > self.max_frame_size as usize {
            bail!("frame of {} bytes exceeds the maximum frame size of {}", frame.len(), self.max_frame_size);
        }

        let mut close_signal = self.close_signal.subscribe();
        let write = async {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                None => None,
                Some(w) => Some(w.write_all(&frame).await),
            }
        };

        let result = select! {
            result = write => result,
            _ = async { let _ = close_signal.wait_for(|closed| *closed).await; } => None,
        };
        if self.is_closed() {
            // the connection was closed while this write was pending, possibly leaving a partial
            //  frame in the stream
            drop(self.take_idle_writer());
        }

        let result = match result {
            Some(result) => result,
            None => bail!("connection #{} is closed", self.connection_number),
        };
        if let Err(e) = result {
            self.close_with(CloseReason::IoError(e.to_string())).await;
            bail!("error sending on connection #{}: {}", self.connection_number, e);
        }
        Ok(())
    }
}

#[async_trait]
impl <S: AsyncRead + AsyncWrite + Send + 'static> Connection for StreamConnection<S> {
    fn connection_number(&self) -> u64 {
        self.connection_number
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    async fn send(&self, message: WireProtocolMessage) -> anyhow::Result<()> {
        self.write_frame(message.encode()).await
    }

    async fn send_batch(&self, messages: Vec<WireProtocolMessage>) -> anyhow::Result<()> {
        for frame in WireProtocolMessage::encode_batch(&messages, self.max_frame_size) {
            self.write_frame(frame).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.is_closed() {
            if let Some(reader_task) = self.reader_task.lock().take() {
                reader_task.abort();
            }
        }
        self.close_with(CloseReason::LocalClose).await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}


pub struct TcpConnectionFactory {
    config: Arc<TransportConfig>,
}

impl TcpConnectionFactory {
    pub fn new(config: Arc<TransportConfig>) -> TcpConnectionFactory {
        TcpConnectionFactory {
            config,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn connect(&self, addr: SocketAddr) -> anyhow::Result<PhysicalConnection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(StreamConnection::spawn(stream, Some(addr), &self.config))
    }
}
