use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::connection_id::ConnectionId;
use crate::transport::MessageTransport;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportEvent {
    Connected(ConnectionId),
    /// The physical connection was lost or taken down. `forced` distinguishes a local decision
    ///  (e.g. the health checker declaring the peer dead) from the network dropping the
    ///  connection. `generation` is the connection generation that was lost: a server
    ///  transport may have been reattached by the time a listener sees the event.
    Disconnected { connection_id: ConnectionId, forced: bool, generation: u64 },
    /// client side: an attempt to (re-)establish the connection is about to start
    ConnectAttempt(ConnectionId),
    Closed(ConnectionId),
}

impl TransportEvent {
    pub fn connection_id(&self) -> &ConnectionId {
        match self {
            TransportEvent::Connected(id) => id,
            TransportEvent::Disconnected { connection_id, .. } => connection_id,
            TransportEvent::ConnectAttempt(id) => id,
            TransportEvent::Closed(id) => id,
        }
    }
}

/// Listeners are called synchronously on the path that caused the transition, so they must not
///  block. Long running reactions belong on a separate task.
pub trait TransportListener: Send + Sync + 'static {
    fn on_transport_event(&self, transport: &Arc<MessageTransport>, event: &TransportEvent);
}

/// Fan-out of transport events. Listeners are kept in a copy-on-write list and are always called
///  with no transport lock held. Async consumers can subscribe to a broadcast channel instead.
pub struct TransportEventNotifier {
    listeners: RwLock<Arc<Vec<Arc<dyn TransportListener>>>>,
    sender: broadcast::Sender<TransportEvent>,
}
impl TransportEventNotifier {
    pub fn new() -> TransportEventNotifier {
        let (sender, _) = broadcast::channel(128);

        TransportEventNotifier {
            listeners: Default::default(),
            sender,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        let mut listeners = self.listeners.write();
        let mut new_listeners = listeners.as_ref().clone();
        new_listeners.push(listener);
        *listeners = Arc::new(new_listeners);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransportListener>) {
        let mut listeners = self.listeners.write();
        let new_listeners = listeners.iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect::<Vec<_>>();
        *listeners = Arc::new(new_listeners);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.sender.subscribe()
    }

    pub fn notify(&self, transport: &Arc<MessageTransport>, event: TransportEvent) {
        trace!("event: {:?}", event);
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener.on_transport_event(transport, &event);
        }
        let _ = self.sender.send(event);
    }
}

impl Default for TransportEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
