use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::Instant;

use crate::config::HealthCheckerConfig;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProbeAction {
    Nothing,
    SendProbe(u64),
    /// try to open a socket to the peer's callback address
    ConnectBack(SocketAddr),
    Dead,
}

/// Liveness bookkeeping for a single monitored connection. This is pure logic: the health checker
///  feeds it the current time and the connection's last activity, and carries out the resulting
///  [ProbeAction].
///
/// A connection that was silent for the configured idle time is probed every probe interval.
///  If the last of the configured number of probes stays unanswered for another interval, the
///  connection is dead - unless the connect-back check is enabled and succeeds, which grants a
///  new round of probes.
pub struct ProbeContext {
    config: Arc<HealthCheckerConfig>,
    /// the connection generation this context monitors
    generation: u64,
    last_seen_activity: Instant,
    probes_sent: u32,
    last_probe: Option<Instant>,
    next_seq: u64,
    connect_back_in_progress: bool,
    connect_back_failures: u32,
    grace_periods: u32,
}

impl ProbeContext {
    pub fn new(config: Arc<HealthCheckerConfig>, generation: u64, last_activity: Instant) -> ProbeContext {
        ProbeContext {
            config,
            generation,
            last_seen_activity: last_activity,
            probes_sent: 0,
            last_probe: None,
            next_seq: 1,
            connect_back_in_progress: false,
            connect_back_failures: 0,
            grace_periods: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn probes_sent(&self) -> u32 {
        self.probes_sent
    }

    pub fn grace_periods(&self) -> u32 {
        self.grace_periods
    }

    pub fn check(&mut self, now: Instant, last_activity: Instant, callback_addr: Option<SocketAddr>) -> ProbeAction {
        if last_activity > self.last_seen_activity {
            // the peer is alive
            self.last_seen_activity = last_activity;
            self.probes_sent = 0;
            self.last_probe = None;
            self.connect_back_failures = 0;
            self.grace_periods = 0;
        }

        if self.connect_back_in_progress {
            return ProbeAction::Nothing;
        }
        if now.saturating_duration_since(self.last_seen_activity) < self.config.idle_time {
            return ProbeAction::Nothing;
        }
        if let Some(last_probe) = self.last_probe {
            if now.saturating_duration_since(last_probe) < self.config.probe_interval {
                return ProbeAction::Nothing;
            }
        }

        if self.probes_sent < self.config.max_probe_count {
            self.probes_sent += 1;
            self.last_probe = Some(now);
            let seq = self.next_seq;
            self.next_seq += 1;
            return ProbeAction::SendProbe(seq);
        }

        match callback_addr {
            Some(addr) if self.may_connect_back() => {
                self.connect_back_in_progress = true;
                ProbeAction::ConnectBack(addr)
            }
            _ => ProbeAction::Dead,
        }
    }

    fn may_connect_back(&self) -> bool {
        if !self.config.do_socket_connect_extra_check {
            return false;
        }
        match self.config.max_grace_periods {
            Some(max) => self.grace_periods < max,
            None => true,
        }
    }

    /// Returns true if the connection is confirmed dead
    pub fn on_connect_back_result(&mut self, alive: bool) -> bool {
        self.connect_back_in_progress = false;

        if alive {
            // the peer process is there but not responding, e.g. during a long GC pause
            self.grace_periods += 1;
            self.probes_sent = 0;
            self.last_probe = None;
            self.connect_back_failures = 0;
            false
        }
        else {
            self.connect_back_failures += 1;
            self.connect_back_failures >= self.config.socket_connect_max_count
        }
    }
}
