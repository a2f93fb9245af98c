use parking_lot::Mutex;
use tracing::warn;

/// Admission control: counts the clients holding a connection slot and compares that count to
///  the configured maximum (`-1` for unlimited).
pub struct ConnectionPolicy {
    max_connections: i32,
    connected: Mutex<i32>,
}

impl ConnectionPolicy {
    pub fn new(max_connections: i32) -> ConnectionPolicy {
        ConnectionPolicy {
            max_connections,
            connected: Mutex::new(0),
        }
    }

    /// Takes a slot unconditionally. Returns whether the maximum is exceeded *including* this
    ///  client: a caller that rejects the client must give the slot back through
    ///  [ConnectionPolicy::client_disconnected].
    pub fn client_connected(&self) -> bool {
        let mut connected = self.connected.lock();
        *connected += 1;
        self.is_exceeded(*connected)
    }

    pub fn client_disconnected(&self) {
        let mut connected = self.connected.lock();
        if *connected == 0 {
            warn!("client disconnected without holding a connection slot - ignoring");
            return;
        }
        *connected -= 1;
    }

    pub fn max_connections_exceeded(&self) -> bool {
        self.is_exceeded(*self.connected.lock())
    }

    fn is_exceeded(&self, connected: i32) -> bool {
        self.max_connections >= 0 && connected > self.max_connections
    }

    pub fn connected_count(&self) -> i32 {
        *self.connected.lock()
    }

    pub fn max_connections(&self) -> i32 {
        self.max_connections
    }
}
