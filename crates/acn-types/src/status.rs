//! ACN status codes carried by `status` performatives.

/// Result code of an ACN request.
///
/// Numbering matches the protobuf enum used on the wire; gaps are reserved
/// for future codes in each group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    ErrorUnsupportedVersion = 1,
    ErrorUnexpectedPayload = 2,
    ErrorGeneric = 3,
    ErrorDecode = 4,
    ErrorWrongAgentAddress = 10,
    ErrorWrongPublicKey = 11,
    ErrorInvalidProof = 12,
    ErrorUnsupportedLedger = 13,
    ErrorUnknownAgentAddress = 20,
    ErrorAgentNotReady = 21,
}

impl StatusCode {
    /// Decode a raw wire value, mapping unknown values to `ErrorGeneric`.
    pub fn from_wire(value: i32) -> Self {
        Self::try_from(value).unwrap_or(Self::ErrorGeneric)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(StatusCode::Success as i32, 0);
        assert_eq!(StatusCode::ErrorDecode as i32, 4);
        assert_eq!(StatusCode::ErrorInvalidProof as i32, 12);
        assert_eq!(StatusCode::ErrorAgentNotReady as i32, 21);
    }

    #[test]
    fn test_from_wire_unknown() {
        assert_eq!(StatusCode::from_wire(10), StatusCode::ErrorWrongAgentAddress);
        assert_eq!(StatusCode::from_wire(99), StatusCode::ErrorGeneric);
        assert!(StatusCode::from_wire(0).is_success());
    }
}
