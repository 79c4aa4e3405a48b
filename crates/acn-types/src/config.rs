//! Connection configuration, loaded from TOML.
//!
//! Every connection variant has its own section type. All of them are
//! validated eagerly by `validate()` so misconfiguration surfaces when the
//! connection is constructed, never halfway through a connect.

use crate::error::{AcnError, AcnResult};
use crate::record::CertRequest;
use crate::uri::{is_private_ip, Multiaddr, Uri};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Ledgers whose keys can back a proof of representation.
pub const SUPPORTED_LEDGER_IDS: [&str; 3] = ["fetchai", "cosmos", "ethereum"];

/// Default ledger for connection keys.
pub const DEFAULT_LEDGER_ID: &str = "fetchai";

/// Fail unless `ledger_id` is one of [`SUPPORTED_LEDGER_IDS`].
pub fn ensure_supported_ledger(ledger_id: &str) -> AcnResult<()> {
    if SUPPORTED_LEDGER_IDS.contains(&ledger_id) {
        Ok(())
    } else {
        Err(AcnError::Config(format!(
            "Ledger id '{ledger_id}' is not supported. Supported ids: {SUPPORTED_LEDGER_IDS:?}"
        )))
    }
}

/// Load a configuration section from a TOML file.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> AcnResult<T> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        AcnError::Config(format!("cannot read config {}: {e}", path.display()))
    })?;
    let config = toml::from_str::<T>(&contents).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Failed to parse configuration");
        AcnError::Config(format!("invalid config {}: {e}", path.display()))
    })?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Local channel used between the agent and its node process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpcKind {
    /// A pair of named pipes (FIFOs). Unix only.
    Pipe,
    /// A loopback TCP socket.
    Tcp,
}

impl Default for IpcKind {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Pipe
        } else {
            Self::Tcp
        }
    }
}

// ---------------------------------------------------------------------------
// Node connection
// ---------------------------------------------------------------------------

/// Configuration of a connection that runs its own relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnectionConfig {
    /// Address of the agent this connection serves.
    pub agent_address: String,
    /// Public key of the agent.
    pub agent_public_key: String,
    /// Ledger of the node key.
    #[serde(default = "default_ledger_id")]
    pub ledger_id: String,
    /// File holding the node's hex-encoded secp256k1 private key.
    pub node_key_file: PathBuf,
    /// Address the node listens on.
    #[serde(default)]
    pub local_uri: Option<Uri>,
    /// Publicly reachable address. Unset means relayed mode.
    #[serde(default)]
    pub public_uri: Option<Uri>,
    /// Address of the node's delegate service.
    #[serde(default)]
    pub delegate_uri: Option<Uri>,
    /// Address of the node's monitoring endpoint.
    #[serde(default)]
    pub monitoring_uri: Option<Uri>,
    /// Address of the node's mailbox service.
    #[serde(default)]
    pub mailbox_uri: Option<Uri>,
    /// Peers used to join the network.
    #[serde(default)]
    pub entry_peers: Vec<Multiaddr>,
    /// Directory containing the node binary.
    pub build_directory: PathBuf,
    /// Name of the node binary inside `build_directory`.
    #[serde(default = "default_node_binary")]
    pub node_binary: String,
    /// Extra command line arguments passed after the env file.
    #[serde(default)]
    pub node_args: Vec<String>,
    /// Base directory for relative paths.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Node log file.
    #[serde(default = "default_node_log_file")]
    pub log_file: PathBuf,
    /// Node env file, rewritten on every start.
    #[serde(default = "default_node_env_file")]
    pub env_file: PathBuf,
    /// Where the node persists agent records.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    /// Delay before the node registers with its peers, in seconds.
    #[serde(default)]
    pub peer_registration_delay: Option<f64>,
    /// Time allowed for the node to open its channel, in seconds.
    #[serde(default = "default_node_connection_timeout")]
    pub node_connection_timeout: f64,
    /// How often the node may be restarted after failures.
    #[serde(default = "default_max_restarts")]
    pub max_node_restarts: u32,
    /// Time allowed for a status acknowledgement, in seconds.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: f64,
    /// Channel kind between agent and node.
    #[serde(default)]
    pub ipc: IpcKind,
    /// Proof-of-representation requests. Exactly one is required.
    #[serde(default)]
    pub cert_requests: Vec<CertRequest>,
}

impl NodeConnectionConfig {
    /// Check the combination of settings.
    pub fn validate(&self) -> AcnResult<()> {
        ensure_supported_ledger(&self.ledger_id)?;
        check_timeout("node_connection_timeout", self.node_connection_timeout)?;
        check_timeout("ack_timeout", self.ack_timeout)?;
        if let Some(delay) = self.peer_registration_delay {
            if !delay.is_finite() || delay < 0.0 {
                return Err(AcnError::Config(format!(
                    "peer_registration_delay {delay} must be a non-negative number of seconds"
                )));
            }
        }

        match &self.public_uri {
            None => {
                if self.entry_peers.is_empty() {
                    return Err(AcnError::Config(
                        "At least one entry peer should be provided when the node runs in relayed mode"
                            .into(),
                    ));
                }
                if self.delegate_uri.is_some() {
                    warn!("Ignoring delegate uri as the node runs in relayed mode");
                }
            }
            Some(public_uri) => {
                if self.local_uri.is_none() {
                    return Err(AcnError::Config(
                        "Local uri must be set when a public uri is provided".into(),
                    ));
                }
                let hosts: Vec<&str> = std::iter::once(public_uri.host())
                    .chain(self.entry_peers.iter().filter_map(|m| m.host()))
                    .collect();
                if !ip_all_private_or_all_public(&hosts) {
                    return Err(AcnError::Config(
                        "Node's public ip and entry peer ip addresses are not in the same address space (private/public)"
                            .into(),
                    ));
                }
            }
        }

        if self.cert_requests.len() != 1 {
            return Err(AcnError::Config(format!(
                "cert_requests must contain exactly one entry, found {}",
                self.cert_requests.len()
            )));
        }
        Ok(())
    }

    /// The relayed-mode delegate uri is ignored.
    pub fn effective_delegate_uri(&self) -> Option<&Uri> {
        self.public_uri.as_ref().and(self.delegate_uri.as_ref())
    }

    pub fn node_binary_path(&self) -> PathBuf {
        self.build_directory.join(&self.node_binary)
    }

    pub fn log_file_path(&self) -> PathBuf {
        resolve(&self.data_dir, &self.log_file)
    }

    pub fn env_file_path(&self) -> PathBuf {
        resolve(&self.data_dir, &self.env_file)
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        self.storage_path.as_ref().map(|p| resolve(&self.data_dir, p))
    }

    pub fn node_connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.node_connection_timeout)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ack_timeout)
    }
}

/// Whether all literal IP hosts are private or all are public.
///
/// Hostnames that are not IP literals are skipped rather than resolved.
pub fn ip_all_private_or_all_public(hosts: &[&str]) -> bool {
    let mut ips = hosts
        .iter()
        .filter_map(|h| h.trim_matches(['[', ']']).parse::<std::net::IpAddr>().ok());
    let Some(first) = ips.next() else {
        return true;
    };
    let private = is_private_ip(first);
    let loopback = first.is_loopback();
    ips.all(|ip| is_private_ip(ip) == private && ip.is_loopback() == loopback)
}

// ---------------------------------------------------------------------------
// Remote connections (delegate / mailbox)
// ---------------------------------------------------------------------------

/// A remote relay node the client may connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Service address (delegate TLS port or mailbox HTTPS port).
    pub uri: Uri,
    /// Hex-encoded secp256k1 public key of the node.
    pub public_key: String,
}

/// Configuration shared by the delegate and mailbox client connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConnectionConfig {
    /// Address of the agent this connection serves.
    pub agent_address: String,
    /// Public key of the agent.
    pub agent_public_key: String,
    /// Ledger of the agent key.
    #[serde(default = "default_ledger_id")]
    pub ledger_id: String,
    /// Candidate nodes; one is picked at random per connection.
    pub nodes: Vec<RemoteNode>,
    /// Base directory for relative paths.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Attempts made by a full reconnect.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Time allowed for the node's session signature, in seconds.
    #[serde(default = "default_tls_signature_timeout")]
    pub tls_connection_signature_timeout: f64,
    /// Time allowed for a status acknowledgement, in seconds.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: f64,
    /// Sleep between empty mailbox polls, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    /// Proof-of-representation requests. Exactly one per node is required.
    #[serde(default)]
    pub cert_requests: Vec<CertRequest>,
}

impl RemoteConnectionConfig {
    pub fn validate(&self) -> AcnResult<()> {
        ensure_supported_ledger(&self.ledger_id)?;
        if self.nodes.is_empty() {
            return Err(AcnError::Config("at least one remote node must be configured".into()));
        }
        if self.cert_requests.len() != self.nodes.len() {
            return Err(AcnError::Config(format!(
                "cert_requests must contain one entry per node ({} nodes, {} requests)",
                self.nodes.len(),
                self.cert_requests.len()
            )));
        }
        for node in &self.nodes {
            if node.public_key.trim().is_empty() {
                return Err(AcnError::Config(format!(
                    "node {} has an empty public key",
                    node.uri
                )));
            }
        }
        check_timeout("tls_connection_signature_timeout", self.tls_connection_signature_timeout)?;
        check_timeout("ack_timeout", self.ack_timeout)?;
        check_timeout("poll_interval", self.poll_interval)?;
        Ok(())
    }

    pub fn tls_connection_signature_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.tls_connection_signature_timeout)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ack_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

fn check_timeout(name: &str, value: f64) -> AcnResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AcnError::Config(format!("{name} must be a positive number of seconds, got {value}")))
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn default_ledger_id() -> String {
    DEFAULT_LEDGER_ID.to_string()
}

fn default_node_binary() -> String {
    "libp2p_node".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_node_log_file() -> PathBuf {
    PathBuf::from("libp2p_node.log")
}

fn default_node_env_file() -> PathBuf {
    PathBuf::from(".env.libp2p")
}

fn default_node_connection_timeout() -> f64 {
    10.0
}

fn default_max_restarts() -> u32 {
    5
}

fn default_ack_timeout() -> f64 {
    5.0
}

fn default_connect_retries() -> u32 {
    3
}

fn default_tls_signature_timeout() -> f64 {
    5.0
}

fn default_poll_interval() -> f64 {
    2.0
}
