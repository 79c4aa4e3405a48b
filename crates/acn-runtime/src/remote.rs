//! Pieces shared by the delegate and mailbox connections.

use crate::retry::RetryConfig;
use acn_types::config::{RemoteConnectionConfig, RemoteNode};
use acn_types::{AcnError, AcnResult, AgentRecord, CertRequest};
use acn_wire::AgentRecordMsg;
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Time allowed to open a TCP/TLS session with a remote node.
pub const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The node a remote connection talks to and the record it registers there.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub node: RemoteNode,
    /// Record built when the target was selected.
    pub record: AgentRecordMsg,
    cert: CertRequest,
    agent_address: String,
    agent_public_key: String,
    data_dir: PathBuf,
}

impl RemoteTarget {
    /// Validate `config` and pick one of its nodes at random.
    ///
    /// The record names the chosen node as the agent's representative, so
    /// its certificate request is the one at the same index.
    pub fn select(config: &RemoteConnectionConfig) -> AcnResult<Self> {
        config.validate()?;
        let index = rand::thread_rng().gen_range(0..config.nodes.len());
        Self::at(config, index)
    }

    /// Target the node at `index`.
    pub fn at(config: &RemoteConnectionConfig, index: usize) -> AcnResult<Self> {
        let node = config
            .nodes
            .get(index)
            .ok_or_else(|| AcnError::Config(format!("no remote node at index {index}")))?;
        let cert = config
            .cert_requests
            .get(index)
            .ok_or_else(|| AcnError::Config(format!("no certificate request for node {}", node.uri)))?;
        let mut target = Self {
            node: node.clone(),
            record: AgentRecordMsg::default(),
            cert: cert.clone(),
            agent_address: config.agent_address.clone(),
            agent_public_key: config.agent_public_key.clone(),
            data_dir: config.data_dir.clone(),
        };
        target.record = target.fresh_record()?;
        info!(node = %node.uri, "Selected remote node");
        Ok(target)
    }

    /// Build the record again from the signature file on disk.
    ///
    /// Called for every connect attempt, so a renewed signature is picked up
    /// and an expired validity window fails the attempt.
    pub fn fresh_record(&self) -> AcnResult<AgentRecordMsg> {
        let record = AgentRecord::from_cert_request(
            &self.cert,
            &self.agent_address,
            &self.agent_public_key,
            &self.node.public_key,
            &self.data_dir,
        )?;
        Ok(AgentRecordMsg::from(&record))
    }
}

pub(crate) fn retry_config(config: &RemoteConnectionConfig) -> RetryConfig {
    RetryConfig::with_attempts(config.connect_retries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> RemoteConnectionConfig {
        toml::from_str(&format!(
            r#"
            agent_address = "fetch1agent"
            agent_public_key = "03aa"
            data_dir = "{}"

            [[nodes]]
            uri = "127.0.0.1:11000"
            public_key = "02bb"

            [[cert_requests]]
            ledger_id = "fetchai"
            not_before = "2022-01-01"
            not_after = "2099-01-01"
            save_path = "cert.txt"
            "#,
            dir.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_record_names_node_as_representative() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cert.txt"), "deadbeef\n").unwrap();
        let target = RemoteTarget::select(&config(dir.path())).unwrap();
        assert_eq!(target.record.address, "fetch1agent");
        assert_eq!(target.record.peer_public_key, "02bb");
        assert_eq!(target.record.signature, "deadbeef");
        assert!(RemoteTarget::at(&config(dir.path()), 1).is_err());
    }

    #[test]
    fn test_fresh_record_reads_signature_again() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cert.txt"), "deadbeef\n").unwrap();
        let target = RemoteTarget::at(&config(dir.path()), 0).unwrap();

        std::fs::write(dir.path().join("cert.txt"), "cafebabe\n").unwrap();
        assert_eq!(target.fresh_record().unwrap().signature, "cafebabe");
        assert_eq!(target.record.signature, "deadbeef");

        std::fs::remove_file(dir.path().join("cert.txt")).unwrap();
        assert!(matches!(target.fresh_record(), Err(AcnError::Config(_))));
    }
}
