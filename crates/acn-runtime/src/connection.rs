//! Connection façade shared by the node, delegate and mailbox variants.
//!
//! [`AcnConnection`] runs two background loops over a
//! [`ConnectionBackend`]: a receive loop filling the inbound queue and a send
//! loop draining the outbound queue. A failed send or read escalates:
//!
//! 1. retry after [`ConnectionBackend::reconnect_transport`],
//! 2. retry after [`ConnectionBackend::rebuild`],
//! 3. give up, tear the connection down and keep the error.
//!
//! Fatal errors (see [`AcnError::is_fatal`]) skip straight to step 3. Both
//! loops may fail on the same broken backend; recoveries are serialized and
//! a loop whose failure predates the latest recovery retries directly
//! instead of recovering again.

use acn_types::{AcnError, AcnResult, Envelope};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// One way of reaching the ACN.
///
/// `cancel` fires when the connection starts disconnecting; long retry
/// loops must stop waiting when it does.
#[async_trait]
pub trait ConnectionBackend: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Set up the client. Called by `connect`.
    async fn establish(&self, cancel: &CancellationToken) -> AcnResult<()>;

    /// Cheap recovery: reopen the transport of the current client.
    async fn reconnect_transport(&self) -> AcnResult<()>;

    /// Expensive recovery: replace the client entirely.
    async fn rebuild(&self, cancel: &CancellationToken) -> AcnResult<()>;

    /// Deliver one envelope and wait for its acknowledgement.
    async fn send_envelope(&self, envelope: &Envelope) -> AcnResult<()>;

    /// Next inbound envelope; `None` when the transport reached its end.
    async fn read_envelope(&self) -> AcnResult<Option<Envelope>>;

    /// Release the client and everything it owns. Idempotent.
    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Reconnect,
    Rebuild,
}

struct Shared<B> {
    backend: Arc<B>,
    state: StdMutex<ConnectionState>,
    last_error: StdMutex<Option<Arc<AcnError>>>,
    generation: AtomicU64,
    recovery: Mutex<()>,
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<Option<Envelope>>>>,
    cancel: StdMutex<CancellationToken>,
}

/// Envelope connection over a backend.
pub struct AcnConnection<B: ConnectionBackend> {
    shared: Arc<Shared<B>>,
    lifecycle: Mutex<()>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Option<Envelope>>>>,
    outbound_tx: StdMutex<Option<mpsc::UnboundedSender<Envelope>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl<B: ConnectionBackend> AcnConnection<B> {
    pub fn new(backend: B) -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            shared: Arc::new(Shared {
                backend: Arc::new(backend),
                state: StdMutex::new(ConnectionState::Disconnected),
                last_error: StdMutex::new(None),
                generation: AtomicU64::new(0),
                recovery: Mutex::new(()),
                inbound_tx: StdMutex::new(None),
                cancel: StdMutex::new(cancel),
            }),
            lifecycle: Mutex::new(()),
            inbound_rx: Mutex::new(None),
            outbound_tx: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The error that tore the connection down, if any.
    pub fn last_error(&self) -> Option<Arc<AcnError>> {
        lock(&self.shared.last_error).clone()
    }

    /// Establish the backend and start both loops. No-op when connected.
    pub async fn connect(&self) -> AcnResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Connected {
            debug!(backend = self.shared.backend.name(), "Already connected");
            return Ok(());
        }
        self.reap_tasks().await;
        self.shared.set_state(ConnectionState::Connecting);
        *lock(&self.shared.last_error) = None;

        let cancel = CancellationToken::new();
        *lock(&self.shared.cancel) = cancel.clone();

        if let Err(e) = self.shared.backend.establish(&cancel).await {
            error!(backend = self.shared.backend.name(), error = %e, "Failed to connect");
            cancel.cancel();
            self.shared.backend.shutdown().await;
            self.shared.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *lock(&self.shared.inbound_tx) = Some(inbound_tx.clone());
        *self.inbound_rx.lock().await = Some(inbound_rx);
        *lock(&self.outbound_tx) = Some(outbound_tx);

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            inbound_tx,
            cancel.clone(),
        ));
        let sender = tokio::spawn(send_loop(Arc::clone(&self.shared), outbound_rx, cancel));
        *lock(&self.tasks) = vec![receiver, sender];

        self.shared.set_state(ConnectionState::Connected);
        info!(backend = self.shared.backend.name(), "Connected");
        Ok(())
    }

    /// Stop both loops, release the backend and wake any waiting receiver.
    /// No-op when disconnected.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == ConnectionState::Disconnected {
            self.reap_tasks().await;
            return;
        }
        self.shared.set_state(ConnectionState::Disconnecting);
        lock(&self.shared.cancel).cancel();
        self.reap_tasks().await;
        lock(&self.outbound_tx).take();
        self.shared.backend.shutdown().await;
        self.shared.push_sentinel();
        self.shared.set_state(ConnectionState::Disconnected);
        info!(backend = self.shared.backend.name(), "Disconnected");
    }

    /// Queue an envelope for delivery.
    ///
    /// Delivery failures surface through [`last_error`](Self::last_error)
    /// once the connection is torn down.
    pub fn send(&self, envelope: Envelope) -> AcnResult<()> {
        envelope.ensure_valid_for_external_comms()?;
        if self.state() != ConnectionState::Connected {
            return Err(AcnError::NotConnected);
        }
        let outbound = lock(&self.outbound_tx);
        let tx = outbound.as_ref().ok_or(AcnError::NotConnected)?;
        tx.send(envelope).map_err(|_| AcnError::NotConnected)
    }

    /// Next inbound envelope, or `None` once the connection has ended.
    pub async fn receive(&self) -> Option<Envelope> {
        let mut guard = self.inbound_rx.lock().await;
        let rx = guard.as_mut()?;
        match rx.recv().await {
            Some(Some(envelope)) => Some(envelope),
            Some(None) | None => {
                debug!("Received end of stream");
                *guard = None;
                None
            }
        }
    }

    async fn reap_tasks(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }
}

impl<B: ConnectionBackend> Drop for AcnConnection<B> {
    fn drop(&mut self) {
        lock(&self.shared.cancel).cancel();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl<B: ConnectionBackend> Shared<B> {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn push_sentinel(&self) {
        if let Some(tx) = lock(&self.inbound_tx).take() {
            let _ = tx.send(None);
        }
    }

    /// Run `tier` unless another loop already recovered since `observed`.
    async fn recover(&self, observed: u64, tier: Tier) -> AcnResult<()> {
        let _recovery = self.recovery.lock().await;
        if self.generation.load(Ordering::SeqCst) != observed {
            debug!(backend = self.backend.name(), "Backend already recovered");
            return Ok(());
        }
        match tier {
            Tier::Reconnect => self.backend.reconnect_transport().await?,
            Tier::Rebuild => self.backend.rebuild(&self.cancel_token()).await?,
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Run `op`, escalating through the recovery tiers on failure.
    async fn with_escalation<T, F, Fut>(&self, what: &str, op: F) -> AcnResult<T>
    where
        F: Fn(Arc<B>) -> Fut,
        Fut: Future<Output = AcnResult<T>>,
    {
        let name = self.backend.name();
        let mut observed = self.generation.load(Ordering::SeqCst);
        let mut last = match op(Arc::clone(&self.backend)).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        for tier in [Tier::Reconnect, Tier::Rebuild] {
            if last.is_fatal() || self.cancel_token().is_cancelled() {
                return Err(last);
            }
            warn!(backend = name, error = %last, ?tier, "Failed to {what}, recovering");
            if let Err(e) = self.recover(observed, tier).await {
                warn!(backend = name, error = %e, ?tier, "Recovery failed");
                observed = self.generation.load(Ordering::SeqCst);
                last = e;
                continue;
            }
            observed = self.generation.load(Ordering::SeqCst);
            match op(Arc::clone(&self.backend)).await {
                Ok(value) => {
                    info!(backend = name, ?tier, "Recovered and managed to {what}");
                    return Ok(value);
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    async fn send_with_recovery(&self, envelope: Envelope) -> AcnResult<()> {
        let envelope = Arc::new(envelope);
        self.with_escalation("send", |backend| {
            let envelope = Arc::clone(&envelope);
            async move { backend.send_envelope(&envelope).await }
        })
        .await
    }

    /// End of stream while connected means the peer went away.
    async fn read_with_recovery(&self) -> AcnResult<Envelope> {
        self.with_escalation("read", |backend| async move {
            backend
                .read_envelope()
                .await?
                .ok_or(AcnError::ConnectionClosed)
        })
        .await
    }

    /// Tear down after an unrecoverable error.
    async fn fail(&self, error: AcnError) {
        let cancel = self.cancel_token();
        if cancel.is_cancelled() {
            debug!(backend = self.backend.name(), error = %error, "Loop stopped during disconnect");
            return;
        }
        error!(backend = self.backend.name(), error = %error, "Connection failed, disconnecting");
        cancel.cancel();
        *lock(&self.last_error) = Some(Arc::new(error));
        self.set_state(ConnectionState::Disconnecting);
        self.backend.shutdown().await;
        self.push_sentinel();
        self.set_state(ConnectionState::Disconnected);
    }
}

async fn receive_loop<B: ConnectionBackend>(
    shared: Arc<Shared<B>>,
    inbound: mpsc::UnboundedSender<Option<Envelope>>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = shared.read_with_recovery() => result,
        };
        match result {
            Ok(envelope) => {
                if inbound.send(Some(envelope)).is_err() {
                    return;
                }
            }
            Err(e) => {
                shared.fail(e).await;
                return;
            }
        }
    }
}

async fn send_loop<B: ConnectionBackend>(
    shared: Arc<Shared<B>>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => return,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };
        let to = envelope.to.clone();
        match shared.send_with_recovery(envelope).await {
            Ok(()) => debug!(to = %to, "Envelope delivered"),
            Err(e) => {
                error!(to = %to, error = %e, "Failed to send envelope");
                shared.fail(e).await;
                return;
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
