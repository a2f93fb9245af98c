use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::HealthCheckerConfig;
use crate::connection_id::ConnectionId;
use crate::health::connect_back::ConnectBackProbe;
use crate::health::probe_context::{ProbeAction, ProbeContext};
use crate::transport::transport_events::{TransportEvent, TransportListener};
use crate::transport::MessageTransport;

struct MonitoredConnection {
    transport: Arc<MessageTransport>,
    probe: ProbeContext,
}

/// Watches connected transports for liveness. The checker is registered as a
///  [TransportListener]: a transport is monitored from the moment it connects until it is
///  disconnected or closed.
///
/// A background task periodically checks all monitored connections (see [ProbeContext] for the
///  policy) and sends probes, runs connect-back checks and takes dead connections down. None of
///  this happens on the transports' send or receive paths.
pub struct ConnectionHealthChecker {
    myself: Weak<ConnectionHealthChecker>,
    config: Arc<HealthCheckerConfig>,
    connect_back: Arc<dyn ConnectBackProbe>,
    monitored: Mutex<FxHashMap<ConnectionId, MonitoredConnection>>,
    total_probes_sent: AtomicU64,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHealthChecker {
    pub fn new(config: Arc<HealthCheckerConfig>, connect_back: Arc<dyn ConnectBackProbe>) -> Arc<ConnectionHealthChecker> {
        Arc::new_cyclic(|myself| ConnectionHealthChecker {
            myself: myself.clone(),
            config,
            connect_back,
            monitored: Default::default(),
            total_probes_sent: AtomicU64::new(0),
            monitor_task: Default::default(),
        })
    }

    /// Starts the background monitor; a no-op for a disabled checker or if it is running already
    pub fn start(&self) {
        if !self.config.enabled {
            debug!("health checker {} is disabled", self.config.name);
            return;
        }

        let mut monitor_task = self.monitor_task.lock();
        if monitor_task.is_some() {
            return;
        }

        info!("starting health checker {}", self.config.name);
        *monitor_task = Some(tokio::spawn(monitor_loop(self.myself.clone(), self.config.probe_interval)));
    }

    pub fn stop(&self) {
        if let Some(task) = self.monitor_task.lock().take() {
            info!("stopping health checker {}", self.config.name);
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.monitor_task.lock().is_some()
    }

    pub fn total_conns_under_monitor(&self) -> usize {
        self.monitored.lock().len()
    }

    pub fn total_probes_sent_on_all_conns(&self) -> u64 {
        self.total_probes_sent.load(Ordering::Relaxed)
    }

    fn start_monitoring(&self, transport: &Arc<MessageTransport>) {
        if !self.config.enabled {
            return;
        }

        let connection_id = transport.connection_id();
        let probe = ProbeContext::new(self.config.clone(), transport.generation(), transport.last_received());
        debug!("{}: monitoring {}", self.config.name, connection_id);
        // a reconnect replaces the context of the previous connection
        self.monitored.lock().insert(connection_id, MonitoredConnection {
            transport: transport.clone(),
            probe,
        });
    }

    fn stop_monitoring(&self, connection_id: &ConnectionId) {
        if self.monitored.lock().remove(connection_id).is_some() {
            debug!("{}: no longer monitoring {}", self.config.name, connection_id);
        }
    }

    fn check_connections(&self) {
        let now = Instant::now();

        let actions = {
            let mut monitored = self.monitored.lock();
            let mut actions = Vec::new();
            for (connection_id, conn) in monitored.iter_mut() {
                if conn.transport.generation() != conn.probe.generation() {
                    // the connection was replaced, and the new one will be registered when it connects
                    continue;
                }

                let action = conn.probe.check(now, conn.transport.last_received(), conn.transport.peer_callback_addr());
                if action != ProbeAction::Nothing {
                    actions.push((connection_id.clone(), conn.transport.clone(), conn.probe.generation(), action));
                }
            }
            actions
        };

        for (connection_id, transport, generation, action) in actions {
            match action {
                ProbeAction::Nothing => {}
                ProbeAction::SendProbe(seq) => {
                    trace!("{}: probing {} (#{})", self.config.name, connection_id, seq);
                    self.total_probes_sent.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(async move {
                        transport.send_ping(seq).await;
                    });
                }
                ProbeAction::ConnectBack(addr) => {
                    debug!("{}: {} does not answer probes - trying to connect back to {}", self.config.name, connection_id, addr);
                    self.spawn_connect_back(connection_id, generation, addr);
                }
                ProbeAction::Dead => self.declare_dead(&connection_id, transport, generation),
            }
        }
    }

    fn spawn_connect_back(&self, connection_id: ConnectionId, generation: u64, addr: SocketAddr) {
        let checker = self.myself.clone();
        let connect_back = self.connect_back.clone();
        let timeout = self.config.socket_connect_timeout;

        tokio::spawn(async move {
            let alive = time::timeout(timeout, connect_back.is_alive(addr)).await
                .unwrap_or(false);

            if let Some(checker) = checker.upgrade() {
                checker.on_connect_back_result(&connection_id, generation, alive);
            }
        });
    }

    fn on_connect_back_result(&self, connection_id: &ConnectionId, generation: u64, alive: bool) {
        let dead_transport = {
            let mut monitored = self.monitored.lock();
            match monitored.get_mut(connection_id) {
                Some(conn) if conn.probe.generation() == generation => {
                    if alive {
                        info!("{}: {} does not answer probes but accepts connections - extending grace period", self.config.name, connection_id);
                    }
                    if conn.probe.on_connect_back_result(alive) {
                        Some(conn.transport.clone())
                    }
                    else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(transport) = dead_transport {
            self.declare_dead(connection_id, transport, generation);
        }
    }

    fn declare_dead(&self, connection_id: &ConnectionId, transport: Arc<MessageTransport>, generation: u64) {
        {
            let mut monitored = self.monitored.lock();
            if matches!(monitored.get(connection_id), Some(conn) if conn.probe.generation() == generation) {
                monitored.remove(connection_id);
            }
        }

        warn!("{}: {} is dead - disconnecting", self.config.name, connection_id);
        tokio::spawn(async move {
            if !transport.disconnect_if_generation(generation).await {
                debug!("{} was reconnected in the meantime", transport.connection_id());
            }
        });
    }
}

impl TransportListener for ConnectionHealthChecker {
    fn on_transport_event(&self, transport: &Arc<MessageTransport>, event: &TransportEvent) {
        match event {
            TransportEvent::Connected(_) => self.start_monitoring(transport),
            TransportEvent::Disconnected { connection_id, .. } | TransportEvent::Closed(connection_id) => self.stop_monitoring(connection_id),
            TransportEvent::ConnectAttempt(_) => {}
        }
    }
}

impl Drop for ConnectionHealthChecker {
    fn drop(&mut self) {
        if let Some(task) = self.monitor_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn monitor_loop(checker: Weak<ConnectionHealthChecker>, tick: Duration) {
    let mut interval = time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match checker.upgrade() {
            Some(checker) => checker.check_connections(),
            None => return,
        }
    }
}
