use std::net::SocketAddr;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// The health checker's last resort before declaring an unresponsive peer dead: can a plain
///  socket to the peer's callback address be opened?
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectBackProbe: Send + Sync + 'static {
    /// The caller applies a timeout
    async fn is_alive(&self, addr: SocketAddr) -> bool;
}

pub struct TcpConnectBackProbe {}

#[async_trait]
impl ConnectBackProbe for TcpConnectBackProbe {
    async fn is_alive(&self, addr: SocketAddr) -> bool {
        match TcpStream::connect(addr).await {
            Ok(_) => {
                trace!("connect-back to {} succeeded", addr);
                true
            }
            Err(e) => {
                debug!("connect-back to {} failed: {}", addr, e);
                false
            }
        }
    }
}

/// Accepts connect-back sockets and drops them right away. The peer only checks whether a
///  connection can be established, which works as long as the process exists - even if it is
///  paused.
pub struct CallbackPortListener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl CallbackPortListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<CallbackPortListener> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("listening for connect-back checks on {}", local_addr);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((_, peer)) => trace!("connect-back check from {}", peer),
                    Err(e) => {
                        warn!("callback port listener failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(CallbackPortListener {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// the port to publish as [crate::config::TransportConfig::callback_port]
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

impl Drop for CallbackPortListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
