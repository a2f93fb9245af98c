use std::time::Duration;

use anyhow::bail;

/// How often a client transport may try to (re-)establish its connection before giving up.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryBudget {
    Unbounded,
    Limited(u32),
}

impl RetryBudget {
    /// Maps the conventional integer configuration value: `-1` (or any negative number) means
    ///  unbounded, `0` means 'do not reconnect'
    pub fn from_config(max_tries: i32) -> RetryBudget {
        match u32::try_from(max_tries) {
            Ok(n) => RetryBudget::Limited(n),
            Err(_) => RetryBudget::Unbounded,
        }
    }

    pub fn allows_reconnect(&self) -> bool {
        *self != RetryBudget::Limited(0)
    }

    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        match self {
            RetryBudget::Unbounded => false,
            RetryBudget::Limited(n) => attempts_made >= *n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// growth factor between consecutive delays, in eighths (16 doubles the delay, values below 8
    ///  are treated as 8, i.e. constant delay)
    pub factor_eighths: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor_eighths: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// upper bound for the whole SYN / SYN_ACK / ACK exchange of a single connect attempt
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    /// frames with a declared length beyond this are treated as corrupt, and the connection is
    ///  closed
    pub max_frame_size: u32,

    pub max_reconnect_tries: RetryBudget,
    pub reconnect_backoff: BackoffConfig,

    /// Server side: the period for which the stack of a disconnected client is kept, waiting for
    ///  the client to reattach with the same connection id. `None` means that a disconnect
    ///  removes the stack immediately.
    pub server_reconnect_window: Option<Duration>,
    /// -1 for 'unlimited'
    pub max_connections: i32,

    /// Client side: the port of a [crate::health::connect_back::CallbackPortListener] that the
    ///  server's health checker may connect to as a liveness check
    pub callback_port: Option<u16>,
    pub stack_layer_flags: u8,

    /// capacity of the channel between a physical connection's reader task and its transport
    pub connection_event_queue_size: usize,
}

impl TransportConfig {
    pub fn new() -> TransportConfig {
        TransportConfig {
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            max_frame_size: 16*1024*1024,
            max_reconnect_tries: RetryBudget::Unbounded,
            reconnect_backoff: BackoffConfig::default(),
            server_reconnect_window: Some(Duration::from_secs(120)),
            max_connections: -1,
            callback_port: None,
            stack_layer_flags: crate::stack::STACK_LAYER_PLAIN,
            connection_event_queue_size: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        if (self.max_frame_size as usize) < crate::wire::WireProtocolHeader::SERIALIZED_LEN + 64 {
            bail!("max frame size {} is too small", self.max_frame_size);
        }
        if self.max_connections < -1 {
            bail!("max connections must be -1 (unlimited) or non-negative, was {}", self.max_connections);
        }
        if self.connection_event_queue_size == 0 {
            bail!("connection event queue size must be positive");
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// used for logging only, typically identifying the direction of monitoring (e.g. 'server
    ///  checking clients')
    pub name: String,
    /// a disabled checker accepts registrations but never probes
    pub enabled: bool,

    /// a connection is probed once nothing was received on it for this long
    pub idle_time: Duration,
    pub probe_interval: Duration,
    pub max_probe_count: u32,

    /// Before declaring an unresponsive peer dead, try to open a plain socket to its published
    ///  callback port. A peer process that is alive but paused (e.g. in a long GC or when it is
    ///  swapped out) still accepts connections at the OS level.
    pub do_socket_connect_extra_check: bool,
    pub socket_connect_timeout: Duration,
    pub socket_connect_max_count: u32,
    /// cap on consecutive grace extensions through successful connect-back checks, `None` for
    ///  no cap
    pub max_grace_periods: Option<u32>,
}

impl HealthCheckerConfig {
    pub fn new(name: &str) -> HealthCheckerConfig {
        HealthCheckerConfig {
            name: name.to_string(),
            enabled: true,
            idle_time: Duration::from_secs(5),
            probe_interval: Duration::from_secs(1),
            max_probe_count: 3,
            do_socket_connect_extra_check: false,
            socket_connect_timeout: Duration::from_secs(2),
            socket_connect_max_count: 2,
            max_grace_periods: None,
        }
    }

    pub fn disabled(name: &str) -> HealthCheckerConfig {
        HealthCheckerConfig {
            enabled: false,
            ..Self::new(name)
        }
    }

    /// the earliest point in time (measured from the last received message) when an unresponsive
    ///  connection is declared dead, disregarding connect-back grace periods
    pub fn death_confirmation_deadline(&self) -> Duration {
        self.idle_time + self.probe_interval * self.max_probe_count
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.idle_time.is_zero() || self.probe_interval.is_zero() || self.max_probe_count == 0 {
            bail!("health checker {}: idle time, probe interval and probe count must be positive", self.name);
        }
        if self.do_socket_connect_extra_check {
            if self.socket_connect_timeout.is_zero() {
                bail!("health checker {}: socket connect timeout must be positive", self.name);
            }
            if self.socket_connect_max_count == 0 {
                bail!("health checker {}: socket connect max count must be at least 1", self.name);
            }
        }
        Ok(())
    }
}
