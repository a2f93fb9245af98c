use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::TransportError;
use crate::transport::{MessageTransport, WireProtocolMessageSink};
use crate::wire::{ProtocolType, WireProtocolMessage};

/// The application's endpoint of a network stack: payloads go out through the transport, and
///  received application payloads are queued for [MessageChannel::receive].
pub struct MessageChannel {
    transport: Weak<MessageTransport>,
    received_send: mpsc::Sender<Bytes>,
    received_recv: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl MessageChannel {
    /// creates the channel and registers it as the transport's receive layer
    pub fn attach(transport: &Arc<MessageTransport>, queue_size: usize) -> Arc<MessageChannel> {
        let (received_send, received_recv) = mpsc::channel(queue_size);
        let channel = Arc::new(MessageChannel {
            transport: Arc::downgrade(transport),
            received_send,
            received_recv: tokio::sync::Mutex::new(received_recv),
        });
        transport.set_receive_layer(channel.clone());
        channel
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        match self.transport.upgrade() {
            Some(transport) => transport.send(WireProtocolMessage::application(payload)).await,
            None => Err(TransportError::Closed),
        }
    }

    /// Sends several payloads, batched into as few frames as the maximum frame size allows
    pub async fn send_batch(&self, payloads: Vec<Bytes>) -> Result<(), TransportError> {
        match self.transport.upgrade() {
            Some(transport) => transport.send_batch(payloads.into_iter().map(WireProtocolMessage::application).collect()).await,
            None => Err(TransportError::Closed),
        }
    }

    /// The next received application payload, `None` after the channel is gone
    pub async fn receive(&self) -> Option<Bytes> {
        self.received_recv.lock().await
            .recv().await
    }
}

#[async_trait]
impl WireProtocolMessageSink for MessageChannel {
    async fn put_message(&self, message: WireProtocolMessage) {
        match message.protocol {
            ProtocolType::Application => {
                trace!("received {} bytes of application data", message.payload.len());
                if self.received_send.send(message.payload).await.is_err() {
                    warn!("message channel receiver is gone - dropping message");
                }
            }
            //TODO pass to a once-and-only-once layer when the stack has one
            p => warn!("plain message channel can not handle {:?} messages - dropping", p),
        }
    }
}
