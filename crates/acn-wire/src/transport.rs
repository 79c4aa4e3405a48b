//! The frame transport contract and the stream plumbing shared by its
//! substrates.
//!
//! A [`FrameTransport`] moves whole frames between two processes. Each
//! substrate (named pipes, TCP, TLS) only knows how to open its byte
//! streams; framing, half-close handling and cancellation of pending reads
//! live in [`FramedStream`].

use crate::frame::AcnFrameCodec;
use acn_types::{AcnError, AcnResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bidirectional, ordered channel of length-prefixed frames.
///
/// All methods take `&self` so that one task can block in [`read`] while
/// another writes.
///
/// [`read`]: FrameTransport::read
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Open the channel, waiting at most `timeout`.
    ///
    /// Returns `false` on failure; the cause is available from
    /// [`last_error`](FrameTransport::last_error). Connecting an open channel
    /// reopens it.
    async fn connect(&self, timeout: Duration) -> bool;

    /// Write one frame.
    async fn write(&self, frame: &[u8]) -> AcnResult<()>;

    /// Read one frame. `None` means the peer closed the channel.
    async fn read(&self) -> AcnResult<Option<Vec<u8>>>;

    /// Close the channel. Pending reads return `None`. Idempotent.
    async fn close(&self);

    /// Why the last `connect` failed.
    fn last_error(&self) -> Option<String>;
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed read and write halves behind async locks.
pub struct FramedStream {
    reader: Mutex<Option<FramedRead<BoxReader, AcnFrameCodec>>>,
    writer: Mutex<Option<FramedWrite<BoxWriter, AcnFrameCodec>>>,
    closed: StdMutex<CancellationToken>,
    /// A zero-length frame signals that the peer is closing.
    empty_frame_is_eof: bool,
    last_error: StdMutex<Option<String>>,
}

impl FramedStream {
    pub fn new(empty_frame_is_eof: bool) -> Self {
        let closed = CancellationToken::new();
        closed.cancel();
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            closed: StdMutex::new(closed),
            empty_frame_is_eof,
            last_error: StdMutex::new(None),
        }
    }

    /// Install freshly opened halves, replacing any previous ones.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.lock_token(), token);
        previous.cancel();

        *self.writer.lock().await = Some(FramedWrite::new(
            Box::new(writer) as BoxWriter,
            AcnFrameCodec::default(),
        ));
        *self.reader.lock().await = Some(FramedRead::new(
            Box::new(reader) as BoxReader,
            AcnFrameCodec::default(),
        ));
        self.set_last_error(None);
    }

    /// Two connected in-process streams.
    pub async fn in_memory_pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = Self::new(false);
        let right = Self::new(false);
        left.attach(ar, aw).await;
        right.attach(br, bw).await;
        (left, right)
    }

    pub fn is_open(&self) -> bool {
        !self.lock_token().is_cancelled()
    }

    pub async fn write(&self, frame: &[u8]) -> AcnResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(AcnError::ConnectionClosed)?;
        writer.send(Bytes::copy_from_slice(frame)).await?;
        debug!(len = frame.len(), "Wrote frame");
        Ok(())
    }

    pub async fn read(&self) -> AcnResult<Option<Vec<u8>>> {
        let token = self.lock_token().clone();
        if token.is_cancelled() {
            return Ok(None);
        }
        let mut guard = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            guard = self.reader.lock() => guard,
        };
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };
        let next = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            next = reader.next() => next,
        };
        match next {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(frame)) if frame.is_empty() && self.empty_frame_is_eof => {
                debug!("Peer signalled end of stream");
                Ok(None)
            }
            Some(Ok(frame)) => {
                debug!(len = frame.len(), "Read frame");
                Ok(Some(frame.to_vec()))
            }
        }
    }

    /// Write the half-close marker (best effort) and drop both halves.
    pub async fn close(&self) {
        let token = self.lock_token().clone();
        if token.is_cancelled() {
            return;
        }
        token.cancel();
        let mut writer = self.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            if self.empty_frame_is_eof {
                let _ = w.send(Bytes::new()).await;
            }
            let _ = w.close().await;
        }
        *writer = None;
        drop(writer);
        *self.reader.lock().await = None;
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    fn lock_token(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// An already attached stream; `connect` only reports whether it is open.
#[async_trait]
impl FrameTransport for FramedStream {
    async fn connect(&self, _timeout: Duration) -> bool {
        self.is_open()
    }

    async fn write(&self, frame: &[u8]) -> AcnResult<()> {
        FramedStream::write(self, frame).await
    }

    async fn read(&self) -> AcnResult<Option<Vec<u8>>> {
        FramedStream::read(self).await
    }

    async fn close(&self) {
        FramedStream::close(self).await
    }

    fn last_error(&self) -> Option<String> {
        FramedStream::last_error(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_unattached_stream_is_closed() {
        let stream = FramedStream::new(false);
        assert!(!stream.is_open());
        assert!(matches!(
            stream.write(b"x").await,
            Err(AcnError::ConnectionClosed)
        ));
        assert!(stream.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplex_roundtrip_preserves_order() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = FramedStream::new(false);
        let right = FramedStream::new(false);
        left.attach(ar, aw).await;
        right.attach(br, bw).await;

        for payload in [&b"first"[..], &b""[..], &[0u8, 1, 2, 255][..]] {
            left.write(payload).await.unwrap();
        }
        assert_eq!(right.read().await.unwrap().unwrap(), b"first");
        assert_eq!(right.read().await.unwrap().unwrap(), b"");
        assert_eq!(right.read().await.unwrap().unwrap(), vec![0u8, 1, 2, 255]);
    }

    #[tokio::test]
    async fn test_empty_frame_signals_eof_when_enabled() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let left = FramedStream::new(true);
        let right = FramedStream::new(true);
        left.attach(ar, aw).await;
        right.attach(br, bw).await;

        left.write(b"last").await.unwrap();
        left.close().await;
        assert_eq!(right.read().await.unwrap().unwrap(), b"last");
        assert!(right.read().await.unwrap().is_none());
        assert!(!left.is_open());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_read() {
        let (a, _b) = tokio::io::duplex(64);
        let (ar, aw) = tokio::io::split(a);
        let stream = Arc::new(FramedStream::new(false));
        stream.attach(ar, aw).await;

        let reader = Arc::clone(&stream);
        let pending = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_decode_error() {
        let (mut a, b) = tokio::io::duplex(64);
        let (br, bw) = tokio::io::split(b);
        let stream = FramedStream::new(false);
        stream.attach(br, bw).await;

        let frame = encode_frame(b"0123456789");
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame[..7])
            .await
            .unwrap();
        drop(a);
        assert!(matches!(stream.read().await, Err(AcnError::Decode(_))));
    }
}
