//! Node-side protocol client.
//!
//! [`NodeClient`] speaks the ACN protocol over any [`FrameTransport`]: it
//! wraps envelopes, acknowledges inbound ones, and correlates the single
//! outstanding send with the next status frame. Correlation is positional;
//! the protocol carries no request ids, so at most one send may wait for its
//! status at a time.

use crate::message::{decode_message, encode_message, AcnMessage, AgentRecordMsg, StatusBody};
use crate::transport::FrameTransport;
use acn_types::{AcnError, AcnResult, Envelope, ErrorKind, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Time allowed for a status acknowledgement.
pub const ACN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type PendingSlot = Mutex<Option<oneshot::Sender<StatusBody>>>;

/// ACN client over a frame transport.
pub struct NodeClient {
    transport: Arc<dyn FrameTransport>,
    record: Option<AgentRecordMsg>,
    ack_timeout: Duration,
    pending: PendingSlot,
}

/// Clears the pending slot when a send finishes, fails or is cancelled.
struct PendingGuard<'a> {
    slot: &'a PendingSlot,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl NodeClient {
    pub fn new(transport: Arc<dyn FrameTransport>) -> Self {
        Self {
            transport,
            record: None,
            ack_timeout: ACN_ACK_TIMEOUT,
            pending: Mutex::new(None),
        }
    }

    /// Record sent by [`register`](NodeClient::register).
    pub fn with_record(mut self, record: AgentRecordMsg) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        &self.transport
    }

    /// Send an envelope and wait for the node's status.
    ///
    /// Requires a concurrent [`read_envelope`](NodeClient::read_envelope)
    /// loop to deliver the status. Fails fast with [`AcnError::AckPending`]
    /// if another send is still waiting.
    pub async fn send_envelope(&self, envelope: &Envelope) -> AcnResult<()> {
        let rx = {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(AcnError::AckPending);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };
        let _guard = PendingGuard {
            slot: &self.pending,
        };

        self.write_message(&AcnMessage::envelope(envelope.to_bytes()))
            .await?;

        let status = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => return Err(AcnError::ConnectionClosed),
            Err(_) => {
                warn!(to = %envelope.to, "ACN status acknowledgement timed out");
                return Err(AcnError::AckTimeout);
            }
        };
        debug!(code = ?status.status_code(), "Envelope acknowledged");
        status.into_result()
    }

    /// Read the next envelope.
    ///
    /// Statuses resolve the pending send and are not returned. Returns
    /// `None` when the transport reaches end of stream.
    pub async fn read_envelope(&self) -> AcnResult<Option<Envelope>> {
        loop {
            let frame = match self.transport.read().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Decode => {
                    self.report_decode_error(&e).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let msg = match decode_message(&frame) {
                Ok(msg) => msg,
                Err(AcnError::UnexpectedPayload(kind)) => {
                    warn!(kind = %kind, "Unexpected ACN message from node");
                    self.write_status(StatusBody::error(
                        StatusCode::ErrorUnexpectedPayload,
                        format!("Bad acn message {kind}"),
                    ))
                    .await?;
                    continue;
                }
                Err(e) => {
                    self.report_decode_error(&e).await;
                    return Err(e);
                }
            };

            match msg {
                AcnMessage::AeaEnvelope { envelope, .. } => {
                    return match Envelope::from_bytes(&envelope) {
                        Ok(envelope) => {
                            self.write_status(StatusBody::success()).await?;
                            debug!(sender = %envelope.sender, "Received envelope");
                            Ok(Some(envelope))
                        }
                        Err(e) => {
                            self.report_decode_error(&e).await;
                            Err(e)
                        }
                    };
                }
                AcnMessage::Status(body) => self.resolve_pending(body),
                AcnMessage::Register(_) => {
                    warn!("Node sent a register message to the agent");
                    self.write_status(StatusBody::error(
                        StatusCode::ErrorUnexpectedPayload,
                        "Bad acn message register",
                    ))
                    .await?;
                }
            }
        }
    }

    /// Register the agent record with the node.
    ///
    /// The status is read directly from the transport, so this must run
    /// before any read loop starts. A rejected proof is a trust failure.
    pub async fn register(&self) -> AcnResult<()> {
        let record = self
            .record
            .clone()
            .ok_or_else(|| AcnError::Config("no agent record to register".into()))?;
        self.write_message(&AcnMessage::Register(record)).await?;

        let frame = tokio::time::timeout(self.ack_timeout, self.transport.read())
            .await
            .map_err(|_| AcnError::AckTimeout)??
            .ok_or(AcnError::ConnectionClosed)?;
        match decode_message(&frame)? {
            AcnMessage::Status(body) => match body.status_code() {
                StatusCode::Success => {
                    debug!("Agent registered with node");
                    Ok(())
                }
                code @ (StatusCode::ErrorWrongAgentAddress
                | StatusCode::ErrorWrongPublicKey
                | StatusCode::ErrorInvalidProof
                | StatusCode::ErrorUnsupportedLedger) => Err(AcnError::Trust(format!(
                    "registration rejected with {code:?}: {}",
                    body.msgs.join(": ")
                ))),
                _ => body.into_result(),
            },
            other => Err(AcnError::UnexpectedPayload(format!(
                "expected status after register, got {}",
                other.kind()
            ))),
        }
    }

    /// Close the transport. A send waiting for its status fails.
    pub async fn close(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.transport.close().await;
    }

    fn resolve_pending(&self, body: StatusBody) {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match waiter {
            Some(tx) => {
                let _ = tx.send(body);
            }
            None => warn!(code = ?body.status_code(), "Dropping status with no pending send"),
        }
    }

    async fn report_decode_error(&self, error: &AcnError) {
        let status = StatusBody::error(StatusCode::ErrorDecode, error.to_string());
        if let Err(e) = self.write_status(status).await {
            debug!(error = %e, "Could not report decode error to node");
        }
    }

    async fn write_status(&self, body: StatusBody) -> AcnResult<()> {
        self.write_message(&AcnMessage::Status(body)).await
    }

    async fn write_message(&self, msg: &AcnMessage) -> AcnResult<()> {
        self.transport.write(&encode_message(msg)).await
    }
}
