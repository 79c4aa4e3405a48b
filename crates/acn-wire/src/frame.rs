//! Length-prefixed framing.
//!
//! Every frame on every ACN channel is a 4-byte big-endian length followed by
//! that many payload bytes. A stream that ends exactly on a frame boundary is
//! a clean end of stream; a stream that ends inside a frame is truncated.

use acn_types::AcnError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length header.
pub const HEADER_LEN: usize = 4;

/// Largest frame a channel accepts (64 MB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Encode `payload` as a single frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Decode one frame from the start of `buf`.
///
/// Returns the payload and the number of bytes consumed, or `None` when `buf`
/// does not yet hold a complete frame.
pub fn decode_frame(buf: &[u8]) -> Option<(Vec<u8>, usize)> {
    let header: [u8; 4] = buf.get(..HEADER_LEN)?.try_into().ok()?;
    let len = decode_length(&header) as usize;
    let payload = buf.get(HEADER_LEN..HEADER_LEN + len)?;
    Some((payload.to_vec(), HEADER_LEN + len))
}

/// Streaming codec for ACN frames.
#[derive(Debug, Clone)]
pub struct AcnFrameCodec {
    max_frame_size: u32,
}

impl AcnFrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }
}

impl Default for AcnFrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for AcnFrameCodec {
    type Item = Bytes;
    type Error = AcnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = decode_length(&header);
        if len > self.max_frame_size {
            return Err(AcnError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let total = HEADER_LEN + len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(len as usize).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(AcnError::Decode(format!(
                "truncated frame: stream ended with {} buffered bytes",
                buf.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for AcnFrameCodec {
    type Error = AcnError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(item.len()).map_err(|_| AcnError::FrameTooLarge {
            size: u32::MAX,
            max: self.max_frame_size,
        })?;
        if len > self.max_frame_size {
            return Err(AcnError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn test_encode_layout() {
        let bytes = encode_frame(b"hello");
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..], b"hello");
        assert_eq!(encode_frame(b""), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_frame_partial_and_complete() {
        let bytes = encode_frame(&[9u8; 300]);
        assert!(decode_frame(&bytes[..3]).is_none());
        assert!(decode_frame(&bytes[..100]).is_none());
        let (payload, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(payload, vec![9u8; 300]);
        assert_eq!(consumed, 304);
    }

    #[test]
    fn test_codec_sequences_frames() {
        let mut codec = AcnFrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"three"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"one"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b""[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"three"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_oversized_header() {
        let mut codec = AcnFrameCodec::new(16);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 17][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(AcnError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_eof_at_frame_boundary_is_clean() {
        let mock = tokio_test::io::Builder::new()
            .read(&encode_frame(b"abc"))
            .build();
        let mut framed = FramedRead::new(mock, AcnFrameCodec::default());
        assert_eq!(framed.next().await.unwrap().unwrap(), &b"abc"[..]);
        assert!(framed.next().await.is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_decode_error() {
        // Header announces five bytes, only two arrive.
        let mock = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 5, 1, 2])
            .build();
        let mut framed = FramedRead::new(mock, AcnFrameCodec::default());
        let err = framed.next().await.unwrap().unwrap_err();
        assert!(matches!(err, AcnError::Decode(_)));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let frame = encode_frame(b"split payload");
        let mock = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..7])
            .read(&frame[7..])
            .build();
        let mut framed = FramedRead::new(mock, AcnFrameCodec::default());
        assert_eq!(framed.next().await.unwrap().unwrap(), &b"split payload"[..]);
    }
}
