use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::select;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::config::{RetryBudget, TransportConfig};
use crate::connection::ConnectionFactory;
use crate::error::TransportError;
use crate::transport::{wait_closed, MessageTransport, TransportStatus};
use crate::util::backoff::Backoff;

/// The servers a client may connect to, tried in round-robin order. Several addresses are for
///  failover between the members of a server stripe.
pub struct ConnectionAddressProvider {
    addresses: Vec<SocketAddr>,
    next_index: AtomicUsize,
}
impl ConnectionAddressProvider {
    pub fn new(addresses: Vec<impl ToSocketAddrs>) -> anyhow::Result<ConnectionAddressProvider> {
        let mut resolved = Vec::new();
        for tsa in addresses {
            for sa in tsa.to_socket_addrs()? {
                resolved.push(sa);
            }
        }
        if resolved.is_empty() {
            return Err(anyhow!("at least one server address is required"));
        }

        Ok(ConnectionAddressProvider {
            addresses: resolved,
            next_index: AtomicUsize::new(0),
        })
    }

    pub fn next_address(&self) -> SocketAddr {
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.addresses[idx % self.addresses.len()]
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EstablishMode {
    /// the initial open(): every address is tried at least once, even if reconnects are disabled
    Open,
    Reconnect,
}

/// Drives (re-)connecting a client transport: connect to the next address, perform the
///  handshake, back off and retry until it succeeds, the retry budget is used up, or the
///  transport is closed.
pub struct ClientConnectionEstablisher {
    config: Arc<TransportConfig>,
    connection_factory: Arc<dyn ConnectionFactory>,
    address_provider: ConnectionAddressProvider,
}

impl ClientConnectionEstablisher {
    pub fn new(config: Arc<TransportConfig>, connection_factory: Arc<dyn ConnectionFactory>, address_provider: ConnectionAddressProvider) -> ClientConnectionEstablisher {
        ClientConnectionEstablisher {
            config,
            connection_factory,
            address_provider,
        }
    }

    fn max_attempts(&self, mode: EstablishMode) -> Option<u32> {
        match self.config.max_reconnect_tries {
            RetryBudget::Unbounded => None,
            RetryBudget::Limited(n) => match mode {
                EstablishMode::Open => Some(n.max(self.address_provider.addresses().len() as u32)),
                EstablishMode::Reconnect => Some(n),
            },
        }
    }

    pub async fn establish(&self, transport: &MessageTransport, mode: EstablishMode) -> Result<(), TransportError> {
        let mut status = transport.status_changes();
        let max_attempts = self.max_attempts(mode);
        let mut backoff = Backoff::new(&self.config.reconnect_backoff);
        let mut attempts = 0;

        loop {
            if transport.status() == TransportStatus::Closed {
                return Err(TransportError::Closed);
            }

            attempts += 1;
            let addr = self.address_provider.next_address();
            debug!("connect attempt #{} to {}", attempts, addr);
            transport.notify_connect_attempt();

            let result = select! {
                r = self.connect_once(transport, addr) => r,
                _ = wait_closed(&mut status) => return Err(TransportError::Closed),
            };
            match result {
                Ok(()) => {
                    info!("connected to {} after {} attempt(s)", addr, attempts);
                    return Ok(());
                }
                Err(e) if e.is_permanent() => return Err(e),
                Err(e) => debug!("connect attempt #{} to {} failed: {}", attempts, addr, e),
            }

            if let Some(max_attempts) = max_attempts {
                if attempts >= max_attempts {
                    return Err(TransportError::ReconnectTriesExhausted { attempts });
                }
            }

            select! {
                _ = sleep(backoff.next_delay()) => {}
                _ = wait_closed(&mut status) => return Err(TransportError::Closed),
            }
        }
    }

    async fn connect_once(&self, transport: &MessageTransport, addr: SocketAddr) -> Result<(), TransportError> {
        let physical = match timeout(self.config.connect_timeout, self.connection_factory.connect(addr)).await {
            Ok(Ok(physical)) => physical,
            Ok(Err(e)) => return Err(TransportError::ConnectionLost(format!("connecting to {} failed: {}", addr, e))),
            Err(_) => return Err(TransportError::ConnectionLost(format!("connecting to {} timed out", addr))),
        };
        transport.client_handshake(physical).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rstest::rstest;
    use tokio::time::{self, Instant};

    use super::*;
    use crate::config::BackoffConfig;
    use crate::connection::PhysicalConnection;
    use crate::test_util::{test_config, EventCollector};
    use crate::transport::handshake_error::LoggingHandshakeErrorHandler;
    use crate::transport::transport_events::TransportEvent;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    #[test]
    fn test_round_robin() {
        let provider = ConnectionAddressProvider::new(vec!["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"]).unwrap();
        let actual = (0..7).map(|_| provider.next_address()).collect::<Vec<_>>();
        assert_eq!(actual, vec![
            addr("10.0.0.1:1"), addr("10.0.0.2:2"), addr("10.0.0.3:3"),
            addr("10.0.0.1:1"), addr("10.0.0.2:2"), addr("10.0.0.3:3"),
            addr("10.0.0.1:1"),
        ]);
    }

    #[test]
    fn test_no_addresses() {
        assert!(ConnectionAddressProvider::new(Vec::<SocketAddr>::new()).is_err());
    }

    /// refuses every connection, recording when and where it was asked to connect
    #[derive(Default)]
    struct RefusingConnectionFactory {
        attempts: Mutex<Vec<(Instant, SocketAddr)>>,
    }
    #[async_trait]
    impl ConnectionFactory for RefusingConnectionFactory {
        async fn connect(&self, addr: SocketAddr) -> anyhow::Result<PhysicalConnection> {
            self.attempts.lock().push((Instant::now(), addr));
            Err(anyhow!("connection refused"))
        }
    }

    /// never completes a connect
    struct HangingConnectionFactory {}
    #[async_trait]
    impl ConnectionFactory for HangingConnectionFactory {
        async fn connect(&self, _addr: SocketAddr) -> anyhow::Result<PhysicalConnection> {
            std::future::pending().await
        }
    }

    fn transport(config: TransportConfig, factory: Arc<dyn ConnectionFactory>, addresses: Vec<&str>) -> Arc<MessageTransport> {
        MessageTransport::new_client(
            Arc::new(config),
            factory,
            ConnectionAddressProvider::new(addresses).unwrap(),
            Arc::new(LoggingHandshakeErrorHandler {}),
        )
    }

    fn backoff_millis(initial: u64, max: u64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(initial),
            max_delay: Duration::from_millis(max),
            factor_eighths: 16,
        }
    }

    #[rstest]
    #[case::limited(RetryBudget::Limited(4), EstablishMode::Open, 1, 4)]
    #[case::open_zero_tries_each_address(RetryBudget::Limited(0), EstablishMode::Open, 3, 3)]
    #[case::open_more_addresses_than_tries(RetryBudget::Limited(2), EstablishMode::Open, 3, 3)]
    #[case::reconnect(RetryBudget::Limited(2), EstablishMode::Reconnect, 3, 2)]
    #[tokio::test(start_paused = true)]
    async fn test_retry_budget(#[case] budget: RetryBudget, #[case] mode: EstablishMode, #[case] num_addresses: usize, #[case] expected_attempts: u32) {
        let factory = Arc::new(RefusingConnectionFactory::default());
        let addresses = ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"][..num_addresses].to_vec();
        let transport = transport(TransportConfig {
            max_reconnect_tries: budget,
            reconnect_backoff: backoff_millis(10, 10),
            ..test_config()
        }, factory.clone(), addresses.clone());
        let establisher = transport.establisher().unwrap();

        let result = establisher.establish(&transport, mode).await;
        assert_eq!(result, Err(TransportError::ReconnectTriesExhausted { attempts: expected_attempts }));

        let attempted = factory.attempts.lock().iter().map(|(_, a)| *a).collect::<Vec<_>>();
        let expected = (0..expected_attempts as usize).map(|i| addr(addresses[i % addresses.len()])).collect::<Vec<_>>();
        assert_eq!(attempted, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_between_attempts() {
        let factory = Arc::new(RefusingConnectionFactory::default());
        let transport = transport(TransportConfig {
            max_reconnect_tries: RetryBudget::Limited(5),
            reconnect_backoff: backoff_millis(100, 300),
            ..test_config()
        }, factory.clone(), vec!["10.0.0.1:1"]);

        let _ = transport.establisher().unwrap().establish(&transport, EstablishMode::Reconnect).await;

        let attempts = factory.attempts.lock().iter().map(|(t, _)| *t).collect::<Vec<_>>();
        let gaps = attempts.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
        assert_eq!(gaps, vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
            Duration::from_millis(300),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attempt_events() {
        let factory = Arc::new(RefusingConnectionFactory::default());
        let transport = transport(TransportConfig {
            max_reconnect_tries: RetryBudget::Limited(3),
            reconnect_backoff: backoff_millis(10, 10),
            ..test_config()
        }, factory, vec!["10.0.0.1:1"]);
        let events = EventCollector::register(&transport);

        let _ = transport.establisher().unwrap().establish(&transport, EstablishMode::Open).await;
        assert_eq!(events.count(|e| matches!(e, TransportEvent::ConnectAttempt(_))), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_interrupts_hanging_connect() {
        let transport = transport(TransportConfig {
            connect_timeout: Duration::from_secs(3600),
            ..test_config()
        }, Arc::new(HangingConnectionFactory {}), vec!["10.0.0.1:1"]);

        let t = transport.clone();
        let establish = tokio::spawn(async move {
            let start = Instant::now();
            let result = t.establisher().unwrap().establish(&t, EstablishMode::Open).await;
            (result, start.elapsed())
        });

        time::sleep(Duration::from_secs(1)).await;
        transport.close().await;

        let (result, elapsed) = establish.await.unwrap();
        assert_eq!(result, Err(TransportError::Closed));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let transport = transport(TransportConfig {
            connect_timeout: Duration::from_secs(2),
            max_reconnect_tries: RetryBudget::Limited(1),
            ..test_config()
        }, Arc::new(HangingConnectionFactory {}), vec!["10.0.0.1:1"]);

        let start = Instant::now();
        let result = transport.establisher().unwrap().establish(&transport, EstablishMode::Open).await;
        assert_eq!(result, Err(TransportError::ReconnectTriesExhausted { attempts: 1 }));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
