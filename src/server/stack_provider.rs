use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::connection::PhysicalConnection;
use crate::connection_id::{ConnectionId, ConnectionIdFactory};
use crate::error::{AttachError, StackNotFound};
use crate::server::connection_policy::ConnectionPolicy;
use crate::stack::{NetworkStackHarness, NetworkStackHarnessFactory};
use crate::transport::handshake_error::TransportHandshakeErrorHandler;
use crate::transport::transport_events::{TransportEvent, TransportListener};
use crate::transport::{MessageTransport, TransportStatus};

struct StackEntry {
    harness: Arc<dyn NetworkStackHarness>,
    /// whether this client currently holds a slot in the [ConnectionPolicy]
    counted: bool,
    /// the transport's connection generation of the latest attach; a disconnect of an older
    ///  generation does not release the slot
    generation: u64,
}

/// A newly attached physical connection: the stack it belongs to, and the transport's connection
///  generation for the pending handshake
pub struct AttachedStack {
    pub harness: Arc<dyn NetworkStackHarness>,
    pub generation: u64,
}

/// The server's registry of network stacks by [ConnectionId]. A stack is created when a new
///  client connects, is kept while the client is disconnected (for the reconnect window), and is
///  removed when its transport is closed.
pub struct ServerStackProvider {
    myself: Weak<ServerStackProvider>,
    config: Arc<TransportConfig>,
    id_factory: Arc<ConnectionIdFactory>,
    harness_factory: Arc<dyn NetworkStackHarnessFactory>,
    policy: Arc<ConnectionPolicy>,
    handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>,
    stacks: Mutex<FxHashMap<ConnectionId, StackEntry>>,
    transport_listeners: RwLock<Vec<Arc<dyn TransportListener>>>,
}

impl ServerStackProvider {
    pub fn new(
        config: Arc<TransportConfig>,
        id_factory: Arc<ConnectionIdFactory>,
        harness_factory: Arc<dyn NetworkStackHarnessFactory>,
        policy: Arc<ConnectionPolicy>,
        handshake_error_handler: Arc<dyn TransportHandshakeErrorHandler>,
    ) -> Arc<ServerStackProvider> {
        Arc::new_cyclic(|myself| ServerStackProvider {
            myself: myself.clone(),
            config,
            id_factory,
            harness_factory,
            policy,
            handshake_error_handler,
            stacks: Default::default(),
            transport_listeners: Default::default(),
        })
    }

    /// Registers a listener with every server transport created from now on, e.g. a health
    ///  checker
    pub fn add_transport_listener(&self, listener: Arc<dyn TransportListener>) {
        self.transport_listeners.write().push(listener);
    }

    pub fn policy(&self) -> &Arc<ConnectionPolicy> {
        &self.policy
    }

    pub fn id_factory(&self) -> &Arc<ConnectionIdFactory> {
        &self.id_factory
    }

    /// Restores the stacks of clients that were connected to a previous incarnation of this
    ///  server, so they can reattach with their old connection ids. The stacks are created
    ///  unattached; if a client does not come back within the reconnect window, its stack is
    ///  removed.
    pub fn rebuild(&self, connection_ids: &[ConnectionId]) {
        for connection_id in connection_ids {
            if connection_id.is_null() || self.stacks.lock().contains_key(connection_id) {
                warn!("not rebuilding stack for {}", connection_id);
                continue;
            }

            debug!("rebuilding stack for {}", connection_id);
            let harness = self.create_stack(connection_id.clone());
            self.stacks.lock().insert(connection_id.clone(), StackEntry {
                harness: harness.clone(),
                counted: false,
                generation: harness.transport().generation(),
            });
            self.spawn_reconnect_timer(harness.transport(), harness.transport().generation());
        }
    }

    fn create_stack(&self, connection_id: ConnectionId) -> Arc<dyn NetworkStackHarness> {
        let transport = MessageTransport::new_server(connection_id, self.config.clone(), self.handshake_error_handler.clone());
        transport.add_listener(Arc::new(ProviderListener { provider: self.myself.clone() }));
        for listener in self.transport_listeners.read().iter() {
            transport.add_listener(listener.clone());
        }
        self.harness_factory.create_harness(transport)
    }

    /// Attaches a client's physical connection to its stack.
    ///
    /// A client without a connection id (i.e. with [ConnectionId::NULL_ID]) is new: it gets a new
    ///  id and stack, provided that the [ConnectionPolicy] admits it. A known id is reattached to
    ///  its existing stack, an unknown id fails with [StackNotFound].
    pub async fn attach_new_connection(&self, connection_id: &ConnectionId, physical: PhysicalConnection, peer_callback_port: Option<u16>) -> Result<AttachedStack, AttachError> {
        let connection_id = if connection_id.is_null() {
            if self.policy.client_connected() {
                self.policy.client_disconnected();
                return Err(AttachError::MaxConnectionsExceeded { max_connections: self.policy.max_connections() });
            }

            let new_id = self.id_factory.next_connection_id(None);
            debug!("creating stack for new client {}", new_id);
            let harness = self.create_stack(new_id.clone());
            self.stacks.lock().insert(new_id.clone(), StackEntry {
                generation: harness.transport().generation(),
                harness,
                counted: true,
            });
            new_id
        }
        else {
            debug!("reattaching {}", connection_id);
            connection_id.clone()
        };

        // the connection is installed under the lock, so that slot accounting and disconnect
        //  notifications agree on the current generation
        let installed = {
            let mut stacks = self.stacks.lock();
            let entry = stacks.get_mut(&connection_id)
                .ok_or_else(|| StackNotFound { connection_id: connection_id.clone() })?;
            let installed = entry.harness.transport().install_client_connection(physical, peer_callback_port);
            if let Ok((generation, _)) = &installed {
                entry.generation = *generation;
                if !entry.counted {
                    // reconnecting clients are always readmitted
                    self.policy.client_connected();
                    entry.counted = true;
                }
            }
            installed.map(|(generation, old)| (entry.harness.clone(), generation, old))
        };

        match installed {
            Ok((harness, generation, old)) => {
                if let Some(old) = old {
                    old.close().await;
                }
                Ok(AttachedStack { harness, generation })
            }
            Err(rejected) => {
                // the transport was closed concurrently, and its stack is about to go away
                debug!("could not attach to {}: transport is closed", connection_id);
                rejected.close().await;
                Err(StackNotFound { connection_id }.into())
            }
        }
    }

    pub fn get_stack(&self, connection_id: &ConnectionId) -> Option<Arc<dyn NetworkStackHarness>> {
        self.stacks.lock()
            .get(connection_id)
            .map(|e| e.harness.clone())
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.lock().len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.stacks.lock().keys().cloned().collect()
    }

    /// The client lost the connection of the given generation: its policy slot is released, but
    ///  the stack is kept for the client to reattach. Nothing happens if the client reattached
    ///  in the meantime.
    pub fn notify_transport_disconnected(&self, connection_id: &ConnectionId, generation: u64) {
        let transport = {
            let mut stacks = self.stacks.lock();
            match stacks.get_mut(connection_id) {
                Some(entry) if entry.generation != generation => {
                    debug!("{} reattached before its disconnect was processed", connection_id);
                    return;
                }
                Some(entry) => {
                    if entry.counted {
                        entry.counted = false;
                        self.policy.client_disconnected();
                    }
                    entry.harness.transport().clone()
                }
                None => return,
            }
        };

        if transport.status() == TransportStatus::Reconnecting {
            self.spawn_reconnect_timer(&transport, transport.generation());
        }
    }

    /// If the transport is still waiting for its client when the reconnect window ends, it is
    ///  closed, which removes the stack
    fn spawn_reconnect_timer(&self, transport: &Arc<MessageTransport>, generation: u64) {
        let window = match self.config.server_reconnect_window {
            Some(w) => w,
            None => return,
        };

        let transport = Arc::downgrade(transport);
        tokio::spawn(async move {
            time::sleep(window).await;
            if let Some(transport) = transport.upgrade() {
                if transport.generation() == generation && transport.status() != TransportStatus::Closed {
                    info!("client {} did not reconnect within {:?} - closing", transport.connection_id(), window);
                    transport.close().await;
                }
            }
        });
    }

    pub fn notify_transport_closed(&self, connection_id: &ConnectionId) {
        if let Some(entry) = self.stacks.lock().remove(connection_id) {
            debug!("removed stack for {}", connection_id);
            if entry.counted {
                self.policy.client_disconnected();
            }
        }
    }

    /// Removes a stack for good, closing its transport. Returns false if there was no such stack.
    pub async fn remove_network_stack(&self, connection_id: &ConnectionId) -> bool {
        let entry = self.stacks.lock().remove(connection_id);
        match entry {
            Some(entry) => {
                if entry.counted {
                    self.policy.client_disconnected();
                }
                entry.harness.transport().close().await;
                true
            }
            None => false,
        }
    }

    /// closes all stacks
    pub async fn shutdown(&self) {
        for connection_id in self.connection_ids() {
            self.remove_network_stack(&connection_id).await;
        }
    }
}

struct ProviderListener {
    provider: Weak<ServerStackProvider>,
}

impl TransportListener for ProviderListener {
    fn on_transport_event(&self, _transport: &Arc<MessageTransport>, event: &TransportEvent) {
        let provider = match self.provider.upgrade() {
            Some(p) => p,
            None => return,
        };

        match event {
            TransportEvent::Disconnected { connection_id, generation, .. } => provider.notify_transport_disconnected(connection_id, *generation),
            TransportEvent::Closed(connection_id) => provider.notify_transport_closed(connection_id),
            TransportEvent::Connected(_) | TransportEvent::ConnectAttempt(_) => {}
        }
    }
}
