//! Connection through the delegate service of a remote relay node.
//!
//! The agent keeps one TLS session with the node. Before anything is
//! written the node must prove its identity (see [`acn_wire::tls`]), then
//! the agent registers its record and exchanges framed ACN messages exactly
//! as it would with a local node.

use crate::connection::{AcnConnection, ConnectionBackend};
use crate::remote::{retry_config, RemoteTarget, REMOTE_CONNECT_TIMEOUT};
use crate::retry::{retry_async, RetryConfig};
use acn_types::config::RemoteConnectionConfig;
use acn_types::{AcnError, AcnResult, Envelope};
use acn_wire::{NodeClient, TlsChannel};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection through a delegate node.
pub type DelegateConnection = AcnConnection<DelegateBackend>;

impl DelegateConnection {
    /// Validate `config` and pick the node to use.
    pub fn from_config(config: RemoteConnectionConfig) -> AcnResult<Self> {
        Ok(AcnConnection::new(DelegateBackend::new(config)?))
    }
}

/// Reconnecting makes one verified attempt; rebuilding spends the whole
/// retry budget.
pub struct DelegateBackend {
    target: RemoteTarget,
    retry: RetryConfig,
    signature_timeout: Duration,
    ack_timeout: Duration,
    client: StdMutex<Option<Arc<NodeClient>>>,
}

impl DelegateBackend {
    pub fn new(config: RemoteConnectionConfig) -> AcnResult<Self> {
        let target = RemoteTarget::select(&config)?;
        Ok(Self::with_target(&config, target))
    }

    /// Use a specific target instead of a random one.
    pub fn with_target(config: &RemoteConnectionConfig, target: RemoteTarget) -> Self {
        Self {
            target,
            retry: retry_config(config),
            signature_timeout: config.tls_connection_signature_timeout(),
            ack_timeout: config.ack_timeout(),
            client: StdMutex::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn client(&self) -> AcnResult<Arc<NodeClient>> {
        lock(&self.client).clone().ok_or(AcnError::NotConnected)
    }

    /// Open a verified session and register on it.
    async fn connect_once(&self) -> AcnResult<()> {
        let uri = &self.target.node.uri;
        info!(node = %uri, "Connecting to libp2p node");
        let record = self.target.fresh_record()?;
        let channel = Arc::new(TlsChannel::new(
            uri.clone(),
            self.target.node.public_key.clone(),
            self.signature_timeout,
        ));
        channel.open(REMOTE_CONNECT_TIMEOUT).await?;

        let client = NodeClient::new(channel)
            .with_record(record)
            .with_ack_timeout(self.ack_timeout);
        if let Err(e) = client.register().await {
            client.close().await;
            return Err(e);
        }

        let previous = lock(&self.client).replace(Arc::new(client));
        if let Some(previous) = previous {
            previous.close().await;
        }
        info!(node = %uri, "Successfully connected to libp2p node");
        Ok(())
    }

    async fn connect_with_retries(&self, cancel: &CancellationToken) -> AcnResult<()> {
        retry_async(
            &self.retry,
            cancel,
            |attempt| {
                info!(node = %self.target.node.uri, attempt = attempt + 1, "Connection attempt");
                self.connect_once()
            },
            |e: &AcnError| !e.is_fatal(),
        )
        .await
        .into_result()
    }
}

#[async_trait]
impl ConnectionBackend for DelegateBackend {
    fn name(&self) -> &'static str {
        "p2p_libp2p_client"
    }

    async fn establish(&self, cancel: &CancellationToken) -> AcnResult<()> {
        self.connect_with_retries(cancel).await
    }

    async fn reconnect_transport(&self) -> AcnResult<()> {
        self.connect_once().await
    }

    async fn rebuild(&self, cancel: &CancellationToken) -> AcnResult<()> {
        self.connect_with_retries(cancel).await
    }

    async fn send_envelope(&self, envelope: &Envelope) -> AcnResult<()> {
        self.client()?.send_envelope(envelope).await
    }

    async fn read_envelope(&self) -> AcnResult<Option<Envelope>> {
        self.client()?.read_envelope().await
    }

    async fn shutdown(&self) {
        let client = lock(&self.client).take();
        if let Some(client) = client {
            client.close().await;
        } else {
            debug!("Called shutdown when not connected");
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
