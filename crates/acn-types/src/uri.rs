//! Network addresses: plain `host:port` uris and libp2p multiaddrs.

use crate::error::AcnError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uri {
    host: String,
    port: u16,
}

impl Uri {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an IP address, when it is a literal one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.trim_matches(['[', ']']).parse().ok()
    }
}

impl FromStr for Uri {
    type Err = AcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AcnError::Config(format!("uri '{s}' is not of the form host:port")))?;
        if host.is_empty() {
            return Err(AcnError::Config(format!("uri '{s}' has an empty host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| AcnError::Config(format!("uri '{s}' has an invalid port: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Uri {
    type Error = AcnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Uri> for String {
    fn from(uri: Uri) -> Self {
        uri.to_string()
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Whether an address belongs to a private, loopback or link-local range.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// A libp2p multiaddress such as `/dns4/acn.example/tcp/9000/p2p/16Uiu2...`.
///
/// Only the components needed to describe an entry peer are interpreted;
/// the textual form is preserved exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Multiaddr {
    raw: String,
    components: Vec<(String, String)>,
}

impl Multiaddr {
    /// Host component (`ip4`, `ip6`, `dns`, `dns4` or `dns6`).
    pub fn host(&self) -> Option<&str> {
        self.value_of(&["ip4", "ip6", "dns", "dns4", "dns6"])
    }

    /// TCP or UDP port.
    pub fn port(&self) -> Option<u16> {
        self.value_of(&["tcp", "udp"]).and_then(|p| p.parse().ok())
    }

    /// Peer id of the node (`p2p` or legacy `ipfs` component).
    pub fn peer_id(&self) -> Option<&str> {
        self.value_of(&["p2p", "ipfs"])
    }

    /// The `host:port` this multiaddr points at.
    pub fn uri(&self) -> Option<Uri> {
        Some(Uri::new(self.host()?, self.port()?))
    }

    fn value_of(&self, protocols: &[&str]) -> Option<&str> {
        self.components
            .iter()
            .find(|(proto, _)| protocols.contains(&proto.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

impl FromStr for Multiaddr {
    type Err = AcnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('/')
            .ok_or_else(|| AcnError::Config(format!("multiaddr '{s}' must start with '/'")))?;
        let parts: Vec<&str> = body.split('/').collect();
        if parts.len() % 2 != 0 || parts.iter().any(|p| p.is_empty()) {
            return Err(AcnError::Config(format!(
                "multiaddr '{s}' must be a sequence of /protocol/value pairs"
            )));
        }
        let components = parts
            .chunks(2)
            .map(|pair| (pair[0].to_string(), pair[1].to_string()))
            .collect();
        Ok(Self {
            raw: trimmed.to_string(),
            components,
        })
    }
}

impl TryFrom<String> for Multiaddr {
    type Error = AcnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Multiaddr> for String {
    fn from(addr: Multiaddr) -> Self {
        addr.raw
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
