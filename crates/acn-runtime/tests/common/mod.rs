//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use acn_types::config::{RemoteConnectionConfig, RemoteNode};
use acn_types::{Envelope, Uri};
use acn_wire::tls::{certificate_public_key, crypto_provider};
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const AGENT_ADDRESS: &str = "fetch1agentaddress";
pub const AGENT_PUBLIC_KEY: &str = "02a2c0ba4ba4b6b2b8f5c3d1e0f9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f1a0";
pub const NODE_KEY_HEX: &str = "1111111111111111111111111111111111111111111111111111111111111111";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn envelope(payload: &[u8]) -> Envelope {
    Envelope::new(
        "fetch1receiver",
        AGENT_ADDRESS,
        "fetchai/default:1.0.0",
        payload.to_vec(),
    )
}

/// Swap sender and receiver, as a peer answering would.
pub fn reply_to(envelope: &Envelope) -> Envelope {
    Envelope::new(
        envelope.sender.clone(),
        envelope.to.clone(),
        envelope.protocol_id.clone(),
        envelope.message.clone(),
    )
}

/// Write the proof-of-representation signature file.
pub fn write_cert_signature(dir: &Path) {
    std::fs::write(dir.join("cert.txt"), "30440220deadbeef\n").unwrap();
}

pub fn cert_request_toml() -> &'static str {
    r#"
    [[cert_requests]]
    ledger_id = "fetchai"
    not_before = "2022-01-01"
    not_after = "2099-01-01"
    save_path = "cert.txt"
    "#
}

// ---------------------------------------------------------------------------
// Remote node identity
// ---------------------------------------------------------------------------

/// A relay node's long-term key plus the throwaway TLS certificate it serves.
pub struct NodeIdentity {
    pub key: SigningKey,
    pub cert: CertificateDer<'static>,
    pub server_config: Arc<rustls::ServerConfig>,
}

impl NodeIdentity {
    pub fn new(seed: u8) -> Self {
        let tls_key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&tls_key).unwrap().der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(tls_key.serialize_der()));
        let server_config = rustls::ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key_der)
            .unwrap();
        Self {
            key: SigningKey::from_slice(&[seed; 32]).unwrap(),
            cert,
            server_config: Arc::new(server_config),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_encoded_point(true).as_bytes())
    }

    /// DER signature of the certificate's session key made with `signer`.
    pub fn session_signature(&self, signer: &SigningKey) -> Vec<u8> {
        let session_key = certificate_public_key(self.cert.as_ref()).unwrap();
        let signature: Signature = signer.sign(&session_key);
        signature.to_der().as_bytes().to_vec()
    }

    pub fn own_session_signature(&self) -> Vec<u8> {
        self.session_signature(&self.key)
    }
}

/// Remote connection settings for a single node in `dir`.
pub fn remote_config(dir: &Path, uri: &Uri, node_public_key: &str) -> RemoteConnectionConfig {
    write_cert_signature(dir);
    let toml = format!(
        r#"
        agent_address = "{AGENT_ADDRESS}"
        agent_public_key = "{AGENT_PUBLIC_KEY}"
        data_dir = "{dir}"
        poll_interval = 0.05
        ack_timeout = 2.0
        tls_connection_signature_timeout = 2.0
        nodes = [{{ uri = "{uri}", public_key = "{node_public_key}" }}]
        {certs}
        "#,
        dir = dir.display(),
        certs = cert_request_toml(),
    );
    let config: RemoteConnectionConfig = toml::from_str(&toml).unwrap();
    assert_eq!(
        config.nodes,
        vec![RemoteNode {
            uri: uri.clone(),
            public_key: node_public_key.to_string()
        }]
    );
    config
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
