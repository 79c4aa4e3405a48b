//! secp256k1 keys of relay nodes.

use crate::error::{AcnError, AcnResult};
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::SecretKey;
use std::fmt;
use std::path::Path;

/// Private key a relay node identifies itself with.
#[derive(Clone)]
pub struct NodeKey {
    secret: SecretKey,
}

impl NodeKey {
    /// Parse a hex-encoded 32 byte private key (optionally `0x`-prefixed).
    pub fn from_hex(hex_key: &str) -> AcnResult<Self> {
        let trimmed = hex_key.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = hex::decode(trimmed)
            .map_err(|e| AcnError::Config(format!("node key is not valid hex: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| AcnError::Config("node key is not a valid secp256k1 scalar".into()))?;
        Ok(Self { secret })
    }

    /// Read a key file written by the agent's key management.
    pub fn load(path: &Path) -> AcnResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AcnError::Config(format!("cannot read node key {}: {e}", path.display()))
        })?;
        Self::from_hex(&raw)
    }

    /// Private key as lowercase hex, the form the node process expects.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Compressed SEC1 public key as hex.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.secret.public_key().to_encoded_point(true).as_bytes())
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKey")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a node public key given as hex.
///
/// Accepts compressed (33 bytes) and uncompressed (65 bytes) SEC1 points as
/// well as raw 64 byte `x || y` coordinates.
pub fn parse_public_key(hex_key: &str) -> AcnResult<VerifyingKey> {
    let trimmed = hex_key.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let mut bytes = hex::decode(trimmed)
        .map_err(|e| AcnError::Config(format!("node public key is not valid hex: {e}")))?;
    if bytes.len() == 64 {
        bytes.insert(0, 0x04);
    }
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|_| AcnError::Config("node public key is not a valid secp256k1 point".into()))
}
