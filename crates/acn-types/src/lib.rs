//! Core types for the Agent Communication Network (ACN) transport.
//!
//! This crate defines the data shared by the wire codec and the connection
//! runtime: envelopes, proof-of-representation records, addresses,
//! configuration and the error taxonomy. It performs no network I/O.

pub mod config;
pub mod envelope;
pub mod error;
pub mod key;
pub mod record;
pub mod status;
pub mod uri;

pub use envelope::Envelope;
pub use error::{AcnError, AcnResult, ErrorKind};
pub use key::NodeKey;
pub use record::{AgentRecord, CertRequest};
pub use status::StatusCode;
pub use uri::{Multiaddr, Uri};

/// Version of the ACN protocol spoken by this crate.
pub const ACN_VERSION: &str = "0.1.0";
