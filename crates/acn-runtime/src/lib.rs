//! ACN connection runtime.
//!
//! Three ways for an agent to reach the Agent Communication Network, all
//! behind the same [`AcnConnection`] façade:
//!
//! - [`NodeConnection`]: run a relay node as a child process and talk to it
//!   over a local channel.
//! - [`DelegateConnection`]: a TLS session with a remote node's delegate
//!   service.
//! - [`MailboxConnection`]: polling a remote node's HTTPS mailbox.

pub mod connection;
pub mod delegate;
pub mod mailbox;
pub mod node;
pub mod remote;
pub mod retry;
pub mod supervisor;

pub use connection::{AcnConnection, ConnectionBackend, ConnectionState};
pub use delegate::{DelegateBackend, DelegateConnection};
pub use mailbox::{MailboxBackend, MailboxClient, MailboxConnection};
pub use node::{NodeBackend, NodeConnection};
pub use remote::RemoteTarget;
pub use retry::{RetryConfig, RetryOutcome};
pub use supervisor::{NodeState, NodeSupervisor};
