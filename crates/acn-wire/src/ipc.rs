//! Local channel between an agent and the node process it supervises.

#[cfg(unix)]
use crate::pipe::PipeChannel;
use crate::tcp::TcpChannel;
use crate::transport::FrameTransport;
use acn_types::config::IpcKind;
use acn_types::{AcnError, AcnResult};
use async_trait::async_trait;
use std::time::Duration;

/// Either substrate, selected by [`IpcKind`].
pub enum IpcChannel {
    #[cfg(unix)]
    Pipe(PipeChannel),
    Tcp(TcpChannel),
}

impl IpcChannel {
    /// Create the agent side of a channel.
    pub async fn create(kind: IpcKind) -> AcnResult<Self> {
        match kind {
            #[cfg(unix)]
            IpcKind::Pipe => Ok(Self::Pipe(PipeChannel::create()?)),
            #[cfg(not(unix))]
            IpcKind::Pipe => Err(AcnError::Config(
                "named pipes are not supported on this platform".into(),
            )),
            IpcKind::Tcp => Ok(Self::Tcp(TcpChannel::bind().await?)),
        }
    }

    /// Create the node side of a channel from the endpoints the agent
    /// advertised.
    pub fn peer(kind: IpcKind, in_path: &str, out_path: &str) -> AcnResult<Self> {
        match kind {
            #[cfg(unix)]
            IpcKind::Pipe => Ok(Self::Pipe(PipeChannel::peer(in_path, out_path))),
            #[cfg(not(unix))]
            IpcKind::Pipe => Err(AcnError::Config(
                "named pipes are not supported on this platform".into(),
            )),
            IpcKind::Tcp => {
                let addr = out_path.parse::<std::net::SocketAddr>().map_err(|e| {
                    AcnError::Config(format!("invalid channel address '{out_path}': {e}"))
                })?;
                Ok(Self::Tcp(TcpChannel::peer(addr)))
            }
        }
    }

    /// Endpoint the node writes to (`NODE_TO_AEA`).
    pub fn in_path(&self) -> String {
        match self {
            #[cfg(unix)]
            Self::Pipe(p) => p.in_path().display().to_string(),
            Self::Tcp(t) => t.local_addr().to_string(),
        }
    }

    /// Endpoint the node reads from (`AEA_TO_NODE`).
    pub fn out_path(&self) -> String {
        match self {
            #[cfg(unix)]
            Self::Pipe(p) => p.out_path().display().to_string(),
            Self::Tcp(t) => t.local_addr().to_string(),
        }
    }

    fn inner(&self) -> &dyn FrameTransport {
        match self {
            #[cfg(unix)]
            Self::Pipe(p) => p,
            Self::Tcp(t) => t,
        }
    }
}

#[async_trait]
impl FrameTransport for IpcChannel {
    async fn connect(&self, timeout: Duration) -> bool {
        self.inner().connect(timeout).await
    }

    async fn write(&self, frame: &[u8]) -> AcnResult<()> {
        self.inner().write(frame).await
    }

    async fn read(&self) -> AcnResult<Option<Vec<u8>>> {
        self.inner().read().await
    }

    async fn close(&self) {
        self.inner().close().await
    }

    fn last_error(&self) -> Option<String> {
        self.inner().last_error()
    }
}
