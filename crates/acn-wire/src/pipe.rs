//! Named-pipe (FIFO) substrate.
//!
//! The agent side creates two FIFOs in a private temporary directory and
//! hands their paths to the node through its env file. Both ends open their
//! read FIFO first and then retry the write FIFO until the peer has opened
//! the matching read end, so neither side blocks the runtime while waiting.

use crate::transport::{FrameTransport, FramedStream};
use acn_types::{AcnError, AcnResult};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

/// Attempts made to open the write end within the connect timeout.
pub const PIPE_CONN_ATTEMPTS: u32 = 10;

const NODE_TO_AGENT: &str = "process_to_aea";
const AGENT_TO_NODE: &str = "aea_to_process";

/// A pair of named pipes.
pub struct PipeChannel {
    /// Path this side reads from.
    read_path: PathBuf,
    /// Path this side writes to.
    write_path: PathBuf,
    stream: FramedStream,
    /// Keeps the FIFOs alive on the creating side.
    dir: Option<TempDir>,
}

impl PipeChannel {
    /// Create the FIFOs for the agent side of a channel.
    pub fn create() -> AcnResult<Self> {
        let dir = tempfile::Builder::new().prefix("acn-pipe-").tempdir()?;
        let read_path = dir.path().join(NODE_TO_AGENT);
        let write_path = dir.path().join(AGENT_TO_NODE);
        for path in [&read_path, &write_path] {
            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                AcnError::Transport(format!("mkfifo {} failed: {e}", path.display()))
            })?;
        }
        debug!(dir = %dir.path().display(), "Created pipe channel");
        Ok(Self {
            read_path,
            write_path,
            stream: FramedStream::new(true),
            dir: Some(dir),
        })
    }

    /// The node side of a channel created with [`PipeChannel::create`].
    ///
    /// `agent_in` is the FIFO the agent reads from, `agent_out` the one it
    /// writes to.
    pub fn peer(agent_in: impl Into<PathBuf>, agent_out: impl Into<PathBuf>) -> Self {
        Self {
            read_path: agent_out.into(),
            write_path: agent_in.into(),
            stream: FramedStream::new(true),
            dir: None,
        }
    }

    /// FIFO carrying node-to-agent frames.
    pub fn in_path(&self) -> &Path {
        if self.dir.is_some() {
            &self.read_path
        } else {
            &self.write_path
        }
    }

    /// FIFO carrying agent-to-node frames.
    pub fn out_path(&self) -> &Path {
        if self.dir.is_some() {
            &self.write_path
        } else {
            &self.read_path
        }
    }

    async fn open(&self, timeout: Duration) -> AcnResult<(pipe::Receiver, pipe::Sender)> {
        let mut options = pipe::OpenOptions::new();
        #[cfg(target_os = "linux")]
        options.read_write(true);
        let receiver = options.open_receiver(&self.read_path)?;

        let pause = timeout / PIPE_CONN_ATTEMPTS;
        for attempt in 1..=PIPE_CONN_ATTEMPTS {
            match pipe::OpenOptions::new().open_sender(&self.write_path) {
                Ok(sender) => return Ok((receiver, sender)),
                Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                    debug!(attempt, path = %self.write_path.display(), "Pipe reader not ready yet");
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AcnError::Transport(format!(
            "peer did not open {} within {:?}",
            self.write_path.display(),
            timeout
        )))
    }
}

#[async_trait]
impl FrameTransport for PipeChannel {
    async fn connect(&self, timeout: Duration) -> bool {
        self.stream.close().await;
        match self.open(timeout).await {
            Ok((receiver, sender)) => {
                self.stream.attach(receiver, sender).await;
                debug!(read = %self.read_path.display(), "Pipe channel connected");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect pipe channel");
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
    async fn test_pipe_roundtrip_both_directions() {
        let agent = Arc::new(PipeChannel::create().unwrap());
        let node = Arc::new(PipeChannel::peer(agent.in_path(), agent.out_path()));
        assert_eq!(node.in_path(), agent.in_path());

        let a = Arc::clone(&agent);
        let connecting = tokio::spawn(async move { a.connect(Duration::from_secs(2)).await });
        assert!(node.connect(Duration::from_secs(2)).await);
        assert!(connecting.await.unwrap());

        agent.write(b"to node").await.unwrap();
        assert_eq!(node.read().await.unwrap().unwrap(), b"to node");
        node.write(&[7u8; 16_000]).await.unwrap();
        assert_eq!(agent.read().await.unwrap().unwrap(), vec![7u8; 16_000]);

        node.close().await;
        assert!(agent.read().await.unwrap().is_none());
        agent.close().await;
    }

    #[tokio::test]
    async fn test_connect_times_out_without_peer() {
        let agent = PipeChannel::create().unwrap();
        assert!(!agent.connect(Duration::from_millis(100)).await);
        assert!(agent.last_error().is_some());
    }

    #[tokio::test]
    async fn test_fifos_removed_on_drop() {
        let agent = PipeChannel::create().unwrap();
        let path = agent.in_path().to_path_buf();
        assert!(path.exists());
        drop(agent);
        assert!(!path.exists());
    }
}
