//! ACN wire protocol.
//!
//! Length-prefixed framing, the local channels between an agent and its
//! node process, the protobuf message codec, the node-side protocol client
//! and TLS session verification for remote nodes.

pub mod client;
pub mod frame;
pub mod ipc;
pub mod message;
#[cfg(unix)]
pub mod pipe;
pub mod tcp;
pub mod tls;
pub mod transport;

pub use client::{NodeClient, ACN_ACK_TIMEOUT};
pub use frame::{AcnFrameCodec, MAX_FRAME_SIZE};
pub use ipc::IpcChannel;
pub use message::{decode_message, encode_message, AcnMessage, AgentRecordMsg, StatusBody};
pub use tls::TlsChannel;
pub use transport::{FrameTransport, FramedStream};
