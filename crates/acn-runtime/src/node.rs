//! Connection through a relay node supervised by this process.

use crate::connection::{AcnConnection, ConnectionBackend};
use crate::supervisor::NodeSupervisor;
use acn_types::config::NodeConnectionConfig;
use acn_types::{AcnError, AcnResult, Envelope};
use acn_wire::{FrameTransport, NodeClient};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection that runs its own relay node.
pub type NodeConnection = AcnConnection<NodeBackend>;

impl NodeConnection {
    /// Validate `config` and prepare the node. Nothing is spawned until
    /// `connect`.
    pub fn from_config(config: NodeConnectionConfig) -> AcnResult<Self> {
        Ok(AcnConnection::new(NodeBackend::new(NodeSupervisor::new(config)?)))
    }
}

/// Talks to the node over the supervisor's channel.
///
/// Reconnecting reopens the channel while the process is alive; rebuilding
/// restarts the process, within its restart budget.
pub struct NodeBackend {
    supervisor: NodeSupervisor,
    client: StdMutex<Option<Arc<NodeClient>>>,
}

impl NodeBackend {
    pub fn new(supervisor: NodeSupervisor) -> Self {
        Self {
            supervisor,
            client: StdMutex::new(None),
        }
    }

    pub fn supervisor(&self) -> &NodeSupervisor {
        &self.supervisor
    }

    fn client(&self) -> AcnResult<Arc<NodeClient>> {
        lock(&self.client).clone().ok_or(AcnError::NotConnected)
    }

    fn refresh_client(&self) -> AcnResult<()> {
        let channel = self
            .supervisor
            .channel()
            .ok_or(AcnError::ProcessNotRunning)?;
        let client = NodeClient::new(channel).with_ack_timeout(self.supervisor.config().ack_timeout());
        *lock(&self.client) = Some(Arc::new(client));
        Ok(())
    }
}

#[async_trait]
impl ConnectionBackend for NodeBackend {
    fn name(&self) -> &'static str {
        "p2p_libp2p"
    }

    async fn establish(&self, _cancel: &CancellationToken) -> AcnResult<()> {
        self.supervisor.start().await?;
        self.refresh_client()
    }

    async fn reconnect_transport(&self) -> AcnResult<()> {
        if !self.supervisor.is_running() {
            return Err(AcnError::ProcessNotRunning);
        }
        let channel = self
            .supervisor
            .channel()
            .ok_or(AcnError::ProcessNotRunning)?;
        let timeout = self.supervisor.config().node_connection_timeout();
        if !channel.connect(timeout).await {
            return Err(AcnError::Transport(
                channel
                    .last_error()
                    .unwrap_or_else(|| "node channel reconnect failed".to_string()),
            ));
        }
        debug!("Reconnected to libp2p node");
        Ok(())
    }

    async fn rebuild(&self, _cancel: &CancellationToken) -> AcnResult<()> {
        lock(&self.client).take();
        self.supervisor.restart().await?;
        self.refresh_client()?;
        info!(restarts = self.supervisor.restart_count(), "libp2p node restarted");
        Ok(())
    }

    async fn send_envelope(&self, envelope: &Envelope) -> AcnResult<()> {
        self.client()?.send_envelope(envelope).await
    }

    async fn read_envelope(&self) -> AcnResult<Option<Envelope>> {
        self.client()?.read_envelope().await
    }

    async fn shutdown(&self) {
        lock(&self.client).take();
        self.supervisor.stop().await;
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
