//! Connection through the mailbox service of a remote relay node.
//!
//! The mailbox is a store-and-forward HTTPS API. Envelopes are posted one
//! request at a time and inbound envelopes are polled for. Identity is
//! established once per client: the node's certificate is fetched, its
//! session key signature is checked via `/ssl_signature`, and every later
//! request is pinned to that exact certificate.

use crate::connection::{AcnConnection, ConnectionBackend};
use crate::remote::{retry_config, RemoteTarget, REMOTE_CONNECT_TIMEOUT};
use crate::retry::{retry_async, RetryConfig};
use acn_types::config::{RemoteConnectionConfig, RemoteNode};
use acn_types::{AcnError, AcnResult, Envelope};
use acn_wire::tls;
use acn_wire::AgentRecordMsg;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Header carrying the mailbox session token.
pub const SESSION_HEADER: &str = "Session-Id";

/// Sleep between polls that found no envelope.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

const SESSION_TOKEN_LEN: usize = 32;

/// HTTPS client of one mailbox node.
pub struct MailboxClient {
    node: RemoteNode,
    base_url: String,
    record: AgentRecordMsg,
    http: reqwest::Client,
    session: StdMutex<Option<String>>,
    poll_interval: Duration,
}

impl MailboxClient {
    /// Verify the node's identity and return a client pinned to it.
    ///
    /// Not registered yet; call [`register`](Self::register).
    pub async fn verify(
        node: RemoteNode,
        record: AgentRecordMsg,
        request_timeout: Duration,
    ) -> AcnResult<Self> {
        let certificate = tls::fetch_certificate(&node.uri, REMOTE_CONNECT_TIMEOUT).await?;
        let session_key = tls::certificate_public_key(certificate.as_ref())?;
        let config = tls::client_config(Some(certificate))?;
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(config)
            .connect_timeout(REMOTE_CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| AcnError::Http(format!("cannot build HTTP client: {e}")))?;

        let client = Self {
            base_url: format!("https://{}", node.uri),
            node,
            record,
            http,
            session: StdMutex::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
        };
        let signature = client.get_signature().await?;
        tls::verify_session_signature(&client.node.public_key, &session_key, &signature)?;
        info!(node = %client.node.uri, "Mailbox node verified");
        Ok(client)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn session_token(&self) -> Option<String> {
        lock(&self.session).clone()
    }

    /// Register the agent record and keep the session token.
    pub async fn register(&self) -> AcnResult<()> {
        let response = self
            .http
            .post(self.url("/register"))
            .body(self.record.to_bytes())
            .send()
            .await
            .map_err(request_error)?;
        let body = expect_ok(response).await?;
        let token = String::from_utf8_lossy(&body).trim().to_string();
        if !is_session_token(&token) {
            return Err(AcnError::Http(format!("invalid session token: {token:?}")));
        }
        debug!(node = %self.node.uri, "Registered with mailbox");
        *lock(&self.session) = Some(token);
        Ok(())
    }

    /// Post one envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) -> AcnResult<()> {
        let token = self.token()?;
        let response = self
            .http
            .post(self.url("/send_envelope"))
            .header(SESSION_HEADER, token)
            .body(envelope.to_bytes())
            .send()
            .await
            .map_err(request_error)?;
        expect_ok(response).await?;
        debug!(to = %envelope.to, "Envelope posted to mailbox");
        Ok(())
    }

    /// Poll until an envelope is available.
    pub async fn read_envelope(&self) -> AcnResult<Envelope> {
        loop {
            if let Some(envelope) = self.poll_envelope().await? {
                return Ok(envelope);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Fetch one envelope if the mailbox holds any.
    pub async fn poll_envelope(&self) -> AcnResult<Option<Envelope>> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.url("/get_envelope"))
            .header(SESSION_HEADER, token)
            .send()
            .await
            .map_err(request_error)?;
        let body = expect_ok(response).await?;
        if body.is_empty() {
            return Ok(None);
        }
        Envelope::from_bytes(&body).map(Some)
    }

    /// End the session.
    pub async fn unregister(&self) -> AcnResult<()> {
        let Some(token) = lock(&self.session).take() else {
            return Err(AcnError::NotConnected);
        };
        let response = self
            .http
            .get(self.url("/unregister"))
            .header(SESSION_HEADER, token)
            .send()
            .await
            .map_err(request_error)?;
        expect_ok(response).await?;
        debug!(node = %self.node.uri, "Unregistered from mailbox");
        Ok(())
    }

    /// The node's session signature. Not getting one is a trust failure.
    async fn get_signature(&self) -> AcnResult<Bytes> {
        let response = self
            .http
            .get(self.url("/ssl_signature"))
            .send()
            .await
            .map_err(request_error);
        let signature = match response {
            Ok(response) => expect_ok(response).await,
            Err(e) => Err(e),
        };
        match signature {
            Ok(signature) if !signature.is_empty() => Ok(signature),
            Ok(_) => Err(AcnError::Trust(format!(
                "{} sent an empty session signature",
                self.node.uri
            ))),
            Err(e) => Err(AcnError::Trust(format!(
                "no session signature from {}: {e}",
                self.node.uri
            ))),
        }
    }

    fn token(&self) -> AcnResult<String> {
        lock(&self.session).clone().ok_or(AcnError::NotConnected)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Whether `token` looks like a mailbox session token.
pub fn is_session_token(token: &str) -> bool {
    token.len() == SESSION_TOKEN_LEN && token.chars().all(|c| c.is_ascii_hexdigit())
}

async fn expect_ok(response: reqwest::Response) -> AcnResult<Bytes> {
    let status = response.status();
    let body = response.bytes().await.map_err(request_error)?;
    if status != StatusCode::OK {
        return Err(AcnError::Http(format!(
            "Bad response code: {status} {}",
            String::from_utf8_lossy(&body)
        )));
    }
    Ok(body)
}

fn request_error(e: reqwest::Error) -> AcnError {
    AcnError::Http(e.to_string())
}

/// Connection through a mailbox node.
pub type MailboxConnection = AcnConnection<MailboxBackend>;

impl MailboxConnection {
    /// Validate `config` and pick the node to use.
    pub fn from_config(config: RemoteConnectionConfig) -> AcnResult<Self> {
        Ok(AcnConnection::new(MailboxBackend::new(config)?))
    }
}

/// Reconnecting re-registers over the pinned client; rebuilding verifies
/// the node again from scratch, within the retry budget.
pub struct MailboxBackend {
    target: RemoteTarget,
    retry: RetryConfig,
    request_timeout: Duration,
    poll_interval: Duration,
    client: StdMutex<Option<Arc<MailboxClient>>>,
}

impl MailboxBackend {
    pub fn new(config: RemoteConnectionConfig) -> AcnResult<Self> {
        let target = RemoteTarget::select(&config)?;
        Ok(Self::with_target(&config, target))
    }

    /// Use a specific target instead of a random one.
    pub fn with_target(config: &RemoteConnectionConfig, target: RemoteTarget) -> Self {
        Self {
            target,
            retry: retry_config(config),
            request_timeout: config.ack_timeout().max(REMOTE_CONNECT_TIMEOUT),
            poll_interval: config.poll_interval(),
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

    /// The current client, if connected.
    pub fn client(&self) -> Option<Arc<MailboxClient>> {
        lock(&self.client).clone()
    }

    fn connected_client(&self) -> AcnResult<Arc<MailboxClient>> {
        self.client().ok_or(AcnError::NotConnected)
    }

    async fn connect_once(&self) -> AcnResult<()> {
        info!(node = %self.target.node.uri, "Connecting to mailbox node");
        let client = MailboxClient::verify(
            self.target.node.clone(),
            self.target.fresh_record()?,
            self.request_timeout,
        )
        .await?
        .with_poll_interval(self.poll_interval);
        client.register().await?;

        let previous = lock(&self.client).replace(Arc::new(client));
        if let Some(previous) = previous {
            if let Err(e) = previous.unregister().await {
                debug!(node = %self.target.node.uri, error = %e, "Could not end previous mailbox session");
            }
        }
        info!(node = %self.target.node.uri, "Successfully connected to mailbox node");
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
impl ConnectionBackend for MailboxBackend {
    fn name(&self) -> &'static str {
        "p2p_libp2p_mailbox"
    }

    async fn establish(&self, cancel: &CancellationToken) -> AcnResult<()> {
        self.connect_with_retries(cancel).await
    }

    async fn reconnect_transport(&self) -> AcnResult<()> {
        self.connected_client()?.register().await
    }

    async fn rebuild(&self, cancel: &CancellationToken) -> AcnResult<()> {
        self.connect_with_retries(cancel).await
    }

    async fn send_envelope(&self, envelope: &Envelope) -> AcnResult<()> {
        self.connected_client()?.send_envelope(envelope).await
    }

    async fn read_envelope(&self) -> AcnResult<Option<Envelope>> {
        self.connected_client()?.read_envelope().await.map(Some)
    }

    async fn shutdown(&self) {
        let client = lock(&self.client).take();
        if let Some(client) = client {
            if let Err(e) = client.unregister().await {
                warn!(node = %self.target.node.uri, error = %e, "Failed to unregister from mailbox");
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
