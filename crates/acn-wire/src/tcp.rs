//! Loopback TCP substrate.
//!
//! The agent binds an ephemeral port when the channel is created, passes
//! `127.0.0.1:<port>` to the node, and accepts the node's connection on
//! `connect`. The node side dials that address with a few retries.

use crate::transport::{FrameTransport, FramedStream};
use acn_types::{AcnError, AcnResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Dial attempts made by the node side within the connect timeout.
pub const TCP_CLIENT_CONN_ATTEMPTS: u32 = 5;

enum Role {
    Listener(TcpListener),
    Dialer,
}

/// A framed loopback TCP channel.
pub struct TcpChannel {
    addr: SocketAddr,
    role: Role,
    stream: FramedStream,
}

impl TcpChannel {
    /// Bind the agent side on an ephemeral loopback port.
    pub async fn bind() -> AcnResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        debug!(%addr, "TCP channel listening");
        Ok(Self {
            addr,
            role: Role::Listener(listener),
            stream: FramedStream::new(false),
        })
    }

    /// The node side, dialing `addr`.
    pub fn peer(addr: SocketAddr) -> Self {
        Self {
            addr,
            role: Role::Dialer,
            stream: FramedStream::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn open(&self, timeout: Duration) -> AcnResult<TcpStream> {
        match &self.role {
            Role::Listener(listener) => {
                let (stream, peer) = tokio::time::timeout(timeout, listener.accept())
                    .await
                    .map_err(|_| {
                        AcnError::Transport(format!(
                            "no connection on {} within {timeout:?}",
                            self.addr
                        ))
                    })??;
                debug!(%peer, "Accepted channel connection");
                Ok(stream)
            }
            Role::Dialer => {
                let pause = timeout / TCP_CLIENT_CONN_ATTEMPTS;
                let mut last_error = None;
                for attempt in 1..=TCP_CLIENT_CONN_ATTEMPTS {
                    match TcpStream::connect(self.addr).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => {
                            debug!(attempt, addr = %self.addr, error = %e, "Channel dial failed");
                            last_error = Some(e);
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
                Err(AcnError::Transport(format!(
                    "could not reach {}: {}",
                    self.addr,
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                )))
            }
        }
    }
}

#[async_trait]
impl FrameTransport for TcpChannel {
    async fn connect(&self, timeout: Duration) -> bool {
        self.stream.close().await;
        match self.open(timeout).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                self.stream.attach(reader, writer).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect TCP channel");
                self.stream.set_last_error(Some(e.to_string()));
                false
            }
        }
    }

    async fn write(&self, frame: &[u8]) -> AcnResult<()> {
        self.stream.write(frame).await
    }

    async fn read(&self) -> AcnResult<Option<Vec<u8>>> {
        self.stream.read().await
    }

    async fn close(&self) {
        self.stream.close().await;
    }

    fn last_error(&self) -> Option<String> {
        self.stream.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let agent = Arc::new(TcpChannel::bind().await.unwrap());
        let node = TcpChannel::peer(agent.local_addr());

        let a = Arc::clone(&agent);
        let accepting = tokio::spawn(async move { a.connect(Duration::from_secs(2)).await });
        assert!(node.connect(Duration::from_secs(2)).await);
        assert!(accepting.await.unwrap());

        node.write(b"").await.unwrap();
        node.write(b"hello agent").await.unwrap();
        assert_eq!(agent.read().await.unwrap().unwrap(), b"");
        assert_eq!(agent.read().await.unwrap().unwrap(), b"hello agent");

        agent.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(node.read().await.unwrap().unwrap(), vec![1, 2, 3]);

        node.close().await;
        assert!(agent.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let agent = TcpChannel::bind().await.unwrap();
        assert!(!agent.connect(Duration::from_millis(50)).await);
        assert!(agent.last_error().unwrap().contains("no connection"));
    }

    #[tokio::test]
    async fn test_dial_gives_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let node = TcpChannel::peer(addr);
        assert!(!node.connect(Duration::from_millis(50)).await);
        assert!(node.last_error().is_some());
    }
}
