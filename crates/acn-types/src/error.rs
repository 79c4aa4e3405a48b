//! Error types shared across the ACN transport crates.

use crate::status::StatusCode;
use thiserror::Error;

/// Coarse error taxonomy used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, read or write failures on the underlying channel.
    TransportIo,
    /// Malformed frames or protocol messages.
    Decode,
    /// Well-formed but unexpected messages, non-success statuses, ack timeouts.
    Protocol,
    /// Session signature or registration proof rejected.
    Trust,
    /// Node process failed to start, crashed, or exhausted its restarts.
    ProcessSupervision,
    /// Invalid configuration detected at construction time.
    Configuration,
}

/// Top-level error type for the ACN transport.
#[derive(Error, Debug)]
pub enum AcnError {
    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel is closed or was never opened.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to establish or use a transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame or message could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// A frame exceeded the transport's size limit.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame size.
        size: u32,
        /// Configured limit.
        max: u32,
    },

    /// A message of the wrong kind arrived.
    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    /// The remote answered with a non-success status.
    #[error("Remote returned status {code:?}: {messages:?}")]
    Status {
        /// Status code reported by the remote.
        code: StatusCode,
        /// Diagnostic messages attached to the status.
        messages: Vec<String>,
    },

    /// No status arrived within the acknowledgement timeout.
    #[error("Timed out waiting for status acknowledgement")]
    AckTimeout,

    /// Another send is already waiting for its status.
    #[error("A status acknowledgement is already pending")]
    AckPending,

    /// The HTTP surface of a remote service misbehaved.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The remote failed to prove possession of its identity.
    #[error("Trust verification failed: {0}")]
    Trust(String),

    /// The node process could not be started or stopped.
    #[error("Node process error: {0}")]
    Process(String),

    /// The node process is not running.
    #[error("Node process is not running")]
    ProcessNotRunning,

    /// The node has been restarted as often as allowed.
    #[error("Max restart attempts reached: {0}")]
    RestartLimit(u32),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An envelope failed validation before sending.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The connection is not in the connected state.
    #[error("Not connected")]
    NotConnected,
}

impl AcnError {
    /// Map this error onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::ConnectionClosed | Self::Transport(_) | Self::NotConnected => {
                ErrorKind::TransportIo
            }
            Self::Decode(_) | Self::FrameTooLarge { .. } => ErrorKind::Decode,
            Self::UnexpectedPayload(_)
            | Self::Status { .. }
            | Self::AckTimeout
            | Self::AckPending
            | Self::Http(_)
            | Self::InvalidEnvelope(_) => ErrorKind::Protocol,
            Self::Trust(_) => ErrorKind::Trust,
            Self::Process(_) | Self::ProcessNotRunning | Self::RestartLimit(_) => {
                ErrorKind::ProcessSupervision
            }
            Self::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether retrying cannot help. Fatal errors skip every recovery tier.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Trust(_) | Self::RestartLimit(_) | Self::Config(_)
        )
    }
}

/// Alias for ACN results.
pub type AcnResult<T> = Result<T, AcnError>;
