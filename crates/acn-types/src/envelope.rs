//! The envelope exchanged between agents over the ACN.
//!
//! The transport treats the `message` payload as opaque bytes; only the
//! addressing fields are inspected, and only for validation before sending.

use crate::error::{AcnError, AcnResult};
use prost::Message;

/// An addressed, opaque message.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Envelope {
    /// Recipient agent address.
    #[prost(string, tag = "1")]
    pub to: String,
    /// Sender agent address.
    #[prost(string, tag = "2")]
    pub sender: String,
    /// Protocol id of the payload (`author/name:version`).
    #[prost(string, tag = "3")]
    pub protocol_id: String,
    /// Opaque payload.
    #[prost(bytes = "vec", tag = "4")]
    pub message: Vec<u8>,
    /// Optional routing uri; empty when unused.
    #[prost(string, tag = "5")]
    pub uri: String,
}

impl Envelope {
    /// Create an envelope without a routing uri.
    pub fn new(
        to: impl Into<String>,
        sender: impl Into<String>,
        protocol_id: impl Into<String>,
        message: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            protocol_id: protocol_id.into(),
            message: message.into(),
            uri: String::new(),
        }
    }

    /// Serialize to the protobuf wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Parse the protobuf wire form.
    pub fn from_bytes(bytes: &[u8]) -> AcnResult<Self> {
        Self::decode(bytes).map_err(|e| AcnError::Decode(format!("envelope: {e}")))
    }

    /// Reject envelopes that cannot leave the local agent.
    ///
    /// Sender and recipient must be non-empty agent addresses; component
    /// public ids address skills inside the agent and are never routed.
    pub fn ensure_valid_for_external_comms(&self) -> AcnResult<()> {
        for (field, value) in [("sender", &self.sender), ("to", &self.to)] {
            if value.is_empty() {
                return Err(AcnError::InvalidEnvelope(format!("{field} is empty")));
            }
            if is_public_id(value) {
                return Err(AcnError::InvalidEnvelope(format!(
                    "{field} '{value}' is a public id, not an agent address"
                )));
            }
        }
        Ok(())
    }
}

/// Whether `s` has the `author/name[:version]` shape of a component id.
pub fn is_public_id(s: &str) -> bool {
    let Some((author, rest)) = s.split_once('/') else {
        return false;
    };
    let name = match rest.split_once(':') {
        Some((name, version)) if !version.is_empty() && !version.contains(char::is_whitespace) => {
            name
        }
        Some(_) => return false,
        None => rest,
    };
    is_identifier(author) && is_identifier(name)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_preserves_payload() {
        let mut env = Envelope::new("agent-b", "agent-a", "fetchai/default:1.0.0", vec![0u8, 255, 7]);
        env.uri = "acn://relay".to_string();
        let decoded = Envelope::from_bytes(&env.to_bytes()).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(decoded.message, vec![0u8, 255, 7]);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = Envelope::from_bytes(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, AcnError::Decode(_)));
    }

    #[test]
    fn test_public_id_detection() {
        assert!(is_public_id("fetchai/default:1.0.0"));
        assert!(is_public_id("valory/p2p_libp2p"));
        assert!(!is_public_id("fetch1x8y3l9kv3cjpqx"));
        assert!(!is_public_id("0xAbC123"));
        assert!(!is_public_id("a/b:"));
        assert!(!is_public_id("1abc/name"));
    }

    #[test]
    fn test_external_comms_validation() {
        let ok = Envelope::new("agent-b", "agent-a", "fetchai/default:1.0.0", b"hi".to_vec());
        assert!(ok.ensure_valid_for_external_comms().is_ok());

        let skill = Envelope::new("fetchai/echo:0.1.0", "agent-a", "p/p:1", b"".to_vec());
        assert!(matches!(
            skill.ensure_valid_for_external_comms(),
            Err(AcnError::InvalidEnvelope(_))
        ));

        let empty = Envelope::new("agent-b", "", "p/p:1", b"".to_vec());
        assert!(empty.ensure_valid_for_external_comms().is_err());
    }
}
