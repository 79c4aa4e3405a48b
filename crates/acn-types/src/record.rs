//! Proof-of-representation records.
//!
//! An [`AgentRecord`] binds an agent address to the public key of the peer
//! that represents it on the network. The binding is attested by a signature
//! the agent produced beforehand for a [`CertRequest`]; the signature file is
//! read at construction and the record is immutable afterwards.

use crate::config::ensure_supported_ledger;
use crate::error::{AcnError, AcnResult};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Service id registered by agents on the ACN.
pub const POR_DEFAULT_SERVICE_ID: &str = "acn";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A request for a signed proof of representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertRequest {
    /// Service id the proof is issued for.
    #[serde(default = "default_identifier")]
    pub identifier: String,
    /// Ledger whose key signed the proof.
    pub ledger_id: String,
    /// First day the proof is valid (`YYYY-MM-DD`).
    pub not_before: NaiveDate,
    /// Last day the proof is valid (`YYYY-MM-DD`).
    pub not_after: NaiveDate,
    /// Template of the signed message.
    #[serde(default = "default_message_format")]
    pub message_format: String,
    /// File holding the signature, relative to the data directory unless absolute.
    pub save_path: PathBuf,
}

fn default_identifier() -> String {
    POR_DEFAULT_SERVICE_ID.to_string()
}

fn default_message_format() -> String {
    "{public_key}".to_string()
}

impl CertRequest {
    /// Render the message that was signed for `public_key`.
    pub fn message(&self, public_key: &str) -> String {
        render_message(
            &self.message_format,
            public_key,
            &self.identifier,
            self.not_before,
            self.not_after,
        )
    }

    /// Resolve the signature file against `data_dir`.
    pub fn signature_path(&self, data_dir: &Path) -> PathBuf {
        if self.save_path.is_absolute() {
            self.save_path.clone()
        } else {
            data_dir.join(&self.save_path)
        }
    }

    /// Read the stored signature.
    pub fn read_signature(&self, data_dir: &Path) -> AcnResult<String> {
        let path = self.signature_path(data_dir);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            AcnError::Config(format!(
                "cannot read certificate signature at {}: {e}",
                path.display()
            ))
        })?;
        let signature = raw.trim().to_string();
        if signature.is_empty() {
            return Err(AcnError::Config(format!(
                "certificate signature at {} is empty",
                path.display()
            )));
        }
        Ok(signature)
    }
}

fn render_message(
    format: &str,
    public_key: &str,
    identifier: &str,
    not_before: NaiveDate,
    not_after: NaiveDate,
) -> String {
    format
        .replace("{public_key}", public_key)
        .replace("{identifier}", identifier)
        .replace("{not_before}", &not_before.format(DATE_FORMAT).to_string())
        .replace("{not_after}", &not_after.format(DATE_FORMAT).to_string())
}

/// Proof that `address` is represented by `representative_public_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    address: String,
    public_key: String,
    representative_public_key: String,
    signature: String,
    ledger_id: String,
    service_id: String,
    not_before: NaiveDate,
    not_after: NaiveDate,
    message_format: String,
}

impl AgentRecord {
    /// Build a record from a certificate request and the signature it points at.
    ///
    /// Fails when the ledger is unsupported or the validity window does not
    /// cover today.
    pub fn from_cert_request(
        cert: &CertRequest,
        address: &str,
        public_key: &str,
        representative_public_key: &str,
        data_dir: &Path,
    ) -> AcnResult<Self> {
        ensure_supported_ledger(&cert.ledger_id)?;
        let signature = cert.read_signature(data_dir)?;
        let record = Self {
            address: address.to_string(),
            public_key: public_key.to_string(),
            representative_public_key: representative_public_key.to_string(),
            signature,
            ledger_id: cert.ledger_id.clone(),
            service_id: cert.identifier.clone(),
            not_before: cert.not_before,
            not_after: cert.not_after,
            message_format: cert.message_format.clone(),
        };
        let today = Utc::now().date_naive();
        if !record.is_valid_on(today) {
            return Err(AcnError::Config(format!(
                "proof of representation is valid from {} to {}, not on {today}",
                record.not_before, record.not_after
            )));
        }
        Ok(record)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn representative_public_key(&self) -> &str {
        &self.representative_public_key
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn ledger_id(&self) -> &str {
        &self.ledger_id
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// `not_before` in wire form.
    pub fn not_before(&self) -> String {
        self.not_before.format(DATE_FORMAT).to_string()
    }

    /// `not_after` in wire form.
    pub fn not_after(&self) -> String {
        self.not_after.format(DATE_FORMAT).to_string()
    }

    /// The message the agent signed.
    pub fn message(&self) -> String {
        render_message(
            &self.message_format,
            &self.representative_public_key,
            &self.service_id,
            self.not_before,
            self.not_after,
        )
    }

    /// Whether `date` falls inside the validity window (inclusive).
    pub fn is_valid_on(&self, date: NaiveDate) -> bool {
        self.not_before <= date && date <= self.not_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(save_path: &str) -> CertRequest {
        CertRequest {
            identifier: POR_DEFAULT_SERVICE_ID.to_string(),
            ledger_id: "fetchai".to_string(),
            not_before: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            not_after: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
            message_format: "{public_key}".to_string(),
            save_path: PathBuf::from(save_path),
        }
    }

    #[test]
    fn test_message_rendering() {
        let mut c = cert("sig.txt");
        c.message_format = "{identifier}:{public_key}:{not_before}:{not_after}".to_string();
        assert_eq!(c.message("02abc"), "acn:02abc:2022-01-01:2099-01-01");
    }

    #[test]
    fn test_record_from_cert_request() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sig.txt"), "deadbeef\n").unwrap();

        let record =
            AgentRecord::from_cert_request(&cert("sig.txt"), "fetch1agent", "03agent", "02peer", dir.path())
                .unwrap();
        assert_eq!(record.signature(), "deadbeef");
        assert_eq!(record.service_id(), "acn");
        assert_eq!(record.message(), "02peer");
        assert_eq!(record.not_before(), "2022-01-01");
        assert!(record.is_valid_on(NaiveDate::from_ymd_opt(2030, 6, 1).unwrap()));
        assert!(!record.is_valid_on(NaiveDate::from_ymd_opt(2021, 12, 31).unwrap()));
    }

    #[test]
    fn test_missing_signature_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentRecord::from_cert_request(&cert("missing.txt"), "a", "b", "c", dir.path())
            .unwrap_err();
        assert!(matches!(err, AcnError::Config(_)));
    }

    #[test]
    fn test_expired_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sig.txt"), "deadbeef").unwrap();
        let mut c = cert("sig.txt");
        c.not_after = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
        assert!(AgentRecord::from_cert_request(&c, "a", "b", "c", dir.path()).is_err());
    }

    #[test]
    fn test_unsupported_ledger_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sig.txt"), "deadbeef").unwrap();
        let mut c = cert("sig.txt");
        c.ledger_id = "bitcoin".to_string();
        assert!(matches!(
            AgentRecord::from_cert_request(&c, "a", "b", "c", dir.path()),
            Err(AcnError::Config(_))
        ));
    }
}
