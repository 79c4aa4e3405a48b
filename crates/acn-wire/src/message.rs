//! ACN protocol messages.
//!
//! Every frame on an ACN channel carries one protobuf-encoded `AcnMessage`
//! whose `performative` oneof selects the message kind. The agent side only
//! ever exchanges envelopes, registrations and statuses; lookups travel
//! between relay nodes and are rejected here as unexpected payloads.

use acn_types::{AcnError, AcnResult, AgentRecord, StatusCode};
use prost::Message;

/// Proof-of-representation as carried on the wire.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct AgentRecordMsg {
    #[prost(string, tag = "1")]
    pub service_id: String,
    #[prost(string, tag = "2")]
    pub ledger_id: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(string, tag = "4")]
    pub public_key: String,
    #[prost(string, tag = "5")]
    pub peer_public_key: String,
    #[prost(string, tag = "6")]
    pub signature: String,
    #[prost(string, tag = "7")]
    pub not_before: String,
    #[prost(string, tag = "8")]
    pub not_after: String,
}

impl From<&AgentRecord> for AgentRecordMsg {
    fn from(record: &AgentRecord) -> Self {
        Self {
            service_id: record.service_id().to_string(),
            ledger_id: record.ledger_id().to_string(),
            address: record.address().to_string(),
            public_key: record.public_key().to_string(),
            peer_public_key: record.representative_public_key().to_string(),
            signature: record.signature().to_string(),
            not_before: record.not_before(),
            not_after: record.not_after(),
        }
    }
}

impl AgentRecordMsg {
    /// Serialize standalone, as the mailbox `/register` body.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> AcnResult<Self> {
        Self::decode(bytes).map_err(|e| AcnError::Decode(format!("agent record: {e}")))
    }
}

/// Outcome of a request.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct StatusBody {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, repeated, tag = "2")]
    pub msgs: Vec<String>,
}

impl StatusBody {
    pub fn success() -> Self {
        Self::new(StatusCode::Success, Vec::new())
    }

    pub fn error(code: StatusCode, msg: impl Into<String>) -> Self {
        Self::new(code, vec![msg.into()])
    }

    pub fn new(code: StatusCode, msgs: Vec<String>) -> Self {
        Self {
            code: code as i32,
            msgs,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_wire(self.code)
    }

    /// Turn a non-success status into an error.
    pub fn into_result(self) -> AcnResult<()> {
        match self.status_code() {
            StatusCode::Success => Ok(()),
            code => Err(AcnError::Status {
                code,
                messages: self.msgs,
            }),
        }
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AeaEnvelopePerformative {
    #[prost(bytes = "vec", tag = "1")]
    pub envelope: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub record: Option<AgentRecordMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LookupRequestPerformative {
    #[prost(string, tag = "1")]
    pub agent_address: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LookupResponsePerformative {
    #[prost(message, optional, tag = "1")]
    pub record: Option<AgentRecordMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterPerformative {
    #[prost(message, optional, tag = "1")]
    pub record: Option<AgentRecordMsg>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StatusPerformative {
    #[prost(message, optional, tag = "1")]
    pub body: Option<StatusBody>,
}

/// Top-level protobuf message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AcnMessageProto {
    #[prost(oneof = "Performative", tags = "5, 6, 7, 8, 9")]
    pub performative: Option<Performative>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Performative {
    #[prost(message, tag = "5")]
    AeaEnvelope(AeaEnvelopePerformative),
    #[prost(message, tag = "6")]
    LookupRequest(LookupRequestPerformative),
    #[prost(message, tag = "7")]
    LookupResponse(LookupResponsePerformative),
    #[prost(message, tag = "8")]
    Register(RegisterPerformative),
    #[prost(message, tag = "9")]
    Status(StatusPerformative),
}

/// The messages an agent exchanges with a relay node.
#[derive(Debug, Clone, PartialEq)]
pub enum AcnMessage {
    /// An encoded envelope, optionally with the sender's record.
    AeaEnvelope {
        envelope: Vec<u8>,
        record: Option<AgentRecordMsg>,
    },
    /// Registration of an agent with its proof of representation.
    Register(AgentRecordMsg),
    /// Acknowledgement of the previous request.
    Status(StatusBody),
}

impl AcnMessage {
    pub fn envelope(envelope: Vec<u8>) -> Self {
        Self::AeaEnvelope {
            envelope,
            record: None,
        }
    }

    /// Short name used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AeaEnvelope { .. } => "aea_envelope",
            Self::Register(_) => "register",
            Self::Status(_) => "status",
        }
    }
}

/// Encode a message into a frame payload.
pub fn encode_message(msg: &AcnMessage) -> Vec<u8> {
    let performative = match msg.clone() {
        AcnMessage::AeaEnvelope { envelope, record } => {
            Performative::AeaEnvelope(AeaEnvelopePerformative { envelope, record })
        }
        AcnMessage::Register(record) => Performative::Register(RegisterPerformative {
            record: Some(record),
        }),
        AcnMessage::Status(body) => Performative::Status(StatusPerformative { body: Some(body) }),
    };
    AcnMessageProto {
        performative: Some(performative),
    }
    .encode_to_vec()
}

/// Decode a frame payload.
///
/// Malformed protobuf is a [`AcnError::Decode`]; a well-formed message of a
/// kind the agent side never handles is an [`AcnError::UnexpectedPayload`].
pub fn decode_message(bytes: &[u8]) -> AcnResult<AcnMessage> {
    let proto = AcnMessageProto::decode(bytes)
        .map_err(|e| AcnError::Decode(format!("acn message: {e}")))?;
    match proto.performative {
        Some(Performative::AeaEnvelope(p)) => Ok(AcnMessage::AeaEnvelope {
            envelope: p.envelope,
            record: p.record,
        }),
        Some(Performative::Register(p)) => Ok(AcnMessage::Register(p.record.unwrap_or_default())),
        Some(Performative::Status(p)) => Ok(AcnMessage::Status(p.body.unwrap_or_default())),
        Some(Performative::LookupRequest(_)) => {
            Err(AcnError::UnexpectedPayload("lookup_request".into()))
        }
        Some(Performative::LookupResponse(_)) => {
            Err(AcnError::UnexpectedPayload("lookup_response".into()))
        }
        None => Err(AcnError::UnexpectedPayload("empty performative".into())),
    }
}
