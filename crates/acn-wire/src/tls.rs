//! TLS sessions with relay nodes and verification of their identity.
//!
//! Relay nodes present throwaway self-signed certificates, so the chain is
//! never validated against a CA. Instead the node proves that the session
//! key in its certificate belongs to it: it signs the raw public key with its
//! long-term secp256k1 key and the client checks that signature against the
//! node public key it was configured with. The TLS handshake signature is
//! still verified, so the server must hold the certificate's private key.

use crate::transport::{FrameTransport, FramedStream};
use acn_types::key::parse_public_key;
use acn_types::{AcnError, AcnResult, Uri};
use async_trait::async_trait;
use k256::ecdsa::signature::DigestVerifier;
use k256::ecdsa::Signature;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// Time allowed for the node's session signature.
pub const TLS_CONNECTION_SIGNATURE_TIMEOUT: Duration = Duration::from_secs(5);

/// The crypto provider used for every ACN TLS session.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Accepts any server certificate, or exactly one when pinned, while still
/// checking handshake signatures.
#[derive(Debug)]
pub struct SessionCertVerifier {
    provider: Arc<CryptoProvider>,
    pinned: Option<CertificateDer<'static>>,
}

impl ServerCertVerifier for SessionCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(pinned) if pinned.as_ref() != end_entity.as_ref() => Err(rustls::Error::General(
                "server certificate differs from the verified session certificate".into(),
            )),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client configuration for node sessions.
///
/// With `pinned` set, only that exact certificate is accepted.
pub fn client_config(pinned: Option<CertificateDer<'static>>) -> AcnResult<rustls::ClientConfig> {
    let provider = crypto_provider();
    let verifier = Arc::new(SessionCertVerifier {
        provider: Arc::clone(&provider),
        pinned,
    });
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AcnError::Transport(format!("TLS configuration: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(config)
}

/// Raw subject public key of a DER certificate.
///
/// For EC keys this is the uncompressed point the node signs.
pub fn certificate_public_key(cert_der: &[u8]) -> AcnResult<Vec<u8>> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| AcnError::Trust(format!("unparseable session certificate: {e}")))?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

/// Check that `signature` (DER ECDSA over SHA-256) was made by the node key
/// `node_public_key` over `session_key`.
pub fn verify_session_signature(
    node_public_key: &str,
    session_key: &[u8],
    signature: &[u8],
) -> AcnResult<()> {
    let key = parse_public_key(node_public_key)?;
    let signature = Signature::from_der(signature)
        .map_err(|e| AcnError::Trust(format!("malformed session signature: {e}")))?;
    let signature = signature.normalize_s().unwrap_or(signature);
    key.verify_digest(Sha256::new_with_prefix(session_key), &signature)
        .map_err(|_| {
            AcnError::Trust("session key is not signed by the configured node key".into())
        })
}

/// A TLS session whose peer certificate has been captured.
pub struct TlsSession {
    pub stream: TlsStream<TcpStream>,
    pub certificate: CertificateDer<'static>,
}

/// Open a TLS session to `uri` within `timeout`.
pub async fn open_session(
    uri: &Uri,
    config: rustls::ClientConfig,
    timeout: Duration,
) -> AcnResult<TlsSession> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect((uri.host(), uri.port())))
        .await
        .map_err(|_| AcnError::Transport(format!("connect to {uri} timed out")))??;
    let server_name = ServerName::try_from(uri.host().to_string())
        .map_err(|e| AcnError::Config(format!("invalid server name '{}': {e}", uri.host())))?;
    let connector = TlsConnector::from(Arc::new(config));
    let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AcnError::Transport(format!("TLS handshake with {uri} timed out")))??;
    let certificate = stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned())
        .ok_or_else(|| AcnError::Trust(format!("{uri} presented no certificate")))?;
    debug!(%uri, "TLS session established");
    Ok(TlsSession {
        stream,
        certificate,
    })
}

/// Fetch the certificate a node currently presents.
pub async fn fetch_certificate(uri: &Uri, timeout: Duration) -> AcnResult<CertificateDer<'static>> {
    let session = open_session(uri, client_config(None)?, timeout).await?;
    let TlsSession {
        mut stream,
        certificate,
    } = session;
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut stream).await;
    Ok(certificate)
}

/// Framed channel to a node's delegate service, verified on connect.
pub struct TlsChannel {
    uri: Uri,
    node_public_key: String,
    signature_timeout: Duration,
    stream: FramedStream,
}

impl TlsChannel {
    pub fn new(uri: Uri, node_public_key: impl Into<String>, signature_timeout: Duration) -> Self {
        Self {
            uri,
            node_public_key: node_public_key.into(),
            signature_timeout,
            stream: FramedStream::new(false),
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Connect and verify the node's session signature.
    ///
    /// The signature is the first frame the node sends. Failing to open the
    /// TLS session is an [`AcnError::Transport`]. Once the session is up, a
    /// signature that is missing, late or does not verify is an
    /// [`AcnError::Trust`]; the session is closed and no frame is ever
    /// written on it.
    pub async fn open(&self, timeout: Duration) -> AcnResult<()> {
        self.stream.close().await;
        let session = open_session(&self.uri, client_config(None)?, timeout).await?;
        let session_key = certificate_public_key(session.certificate.as_ref())?;
        let (reader, writer) = tokio::io::split(session.stream);
        self.stream.attach(reader, writer).await;

        let signature = match tokio::time::timeout(self.signature_timeout, self.stream.read()).await
        {
            Ok(Ok(Some(signature))) => Ok(signature),
            Ok(Ok(None)) => Err(format!(
                "{} closed the session before sending its signature",
                self.uri
            )),
            Ok(Err(e)) => Err(format!("cannot read session signature from {}: {e}", self.uri)),
            Err(_) => Err(format!(
                "no session signature from {} within {:?}",
                self.uri, self.signature_timeout
            )),
        };
        let signature = match signature {
            Ok(signature) => signature,
            Err(reason) => {
                warn!(uri = %self.uri, reason = %reason, "Rejecting node session");
                self.stream.close().await;
                return Err(AcnError::Trust(reason));
            }
        };

        if let Err(e) = verify_session_signature(&self.node_public_key, &session_key, &signature) {
            warn!(uri = %self.uri, error = %e, "Rejecting node session");
            self.stream.close().await;
            return Err(e);
        }
        info!(uri = %self.uri, "Node session verified");
        Ok(())
    }
}

#[async_trait]
impl FrameTransport for TlsChannel {
    async fn connect(&self, timeout: Duration) -> bool {
        match self.open(timeout).await {
            Ok(()) => true,
            Err(e) => {
                self.stream.set_last_error(Some(e.to_string()));
                false
            }
        }
    }

    async fn write(&self, frame: &[u8]) -> AcnResult<()> {
        self.stream.write(frame).await
    }

    async fn read(&self) -> AcnResult<Option<Vec<u8>>> {
        self.stream.read().await
    }

    async fn close(&self) {
        self.stream.close().await;
    }

    fn last_error(&self) -> Option<String> {
        self.stream.last_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use k256::ecdsa::signature::Signer;
    use k256::ecdsa::SigningKey;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    struct TestNode {
        key: SigningKey,
        cert: CertificateDer<'static>,
        acceptor: TlsAcceptor,
    }

    impl TestNode {
        fn new() -> Self {
            let tls_key = rcgen::KeyPair::generate().unwrap();
            let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            let cert = params.self_signed(&tls_key).unwrap();
            let cert_der = cert.der().clone();
            let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(tls_key.serialize_der()));
            let server = rustls::ServerConfig::builder_with_provider(crypto_provider())
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der.clone()], key_der)
                .unwrap();
            Self {
                key: SigningKey::from_slice(&[7u8; 32]).unwrap(),
                cert: cert_der,
                acceptor: TlsAcceptor::from(Arc::new(server)),
            }
        }

        fn public_key_hex(&self) -> String {
            hex::encode(
                self.key
                    .verifying_key()
                    .to_encoded_point(true)
                    .as_bytes(),
            )
        }

        fn session_signature(&self, signer: &SigningKey) -> Vec<u8> {
            let session_key = certificate_public_key(self.cert.as_ref()).unwrap();
            let signature: Signature = signer.sign(&session_key);
            signature.to_der().as_bytes().to_vec()
        }

        /// Accept one session, send `signature`, then echo one frame.
        async fn serve_once(&self, signature: Vec<u8>) -> Uri {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let acceptor = self.acceptor.clone();
            tokio::spawn(async move {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut tls = acceptor.accept(tcp).await.unwrap();
                tls.write_all(&encode_frame(&signature)).await.unwrap();
                let mut header = [0u8; 4];
                if tls.read_exact(&mut header).await.is_err() {
                    return;
                }
                let mut body = vec![0u8; u32::from_be_bytes(header) as usize];
                tls.read_exact(&mut body).await.unwrap();
                tls.write_all(&encode_frame(&body)).await.unwrap();
                tls.flush().await.unwrap();
            });
            Uri::new("127.0.0.1", addr.port())
        }
    }

    /// Accept one session and hang up without sending a signature.
    async fn serve_silent(acceptor: TlsAcceptor) -> Uri {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let _ = tls.shutdown().await;
        });
        Uri::new("127.0.0.1", addr.port())
    }

    #[test]
    fn test_signature_verification() {
        let signer = SigningKey::from_slice(&[3u8; 32]).unwrap();
        let public = hex::encode(signer.verifying_key().to_encoded_point(false).as_bytes());
        let session_key = [4u8; 65];
        let signature: Signature = signer.sign(&session_key);
        let der = signature.to_der();

        verify_session_signature(&public, &session_key, der.as_bytes()).unwrap();
        assert!(matches!(
            verify_session_signature(&public, &[5u8; 65], der.as_bytes()),
            Err(AcnError::Trust(_))
        ));
        assert!(matches!(
            verify_session_signature(&public, &session_key, b"not der"),
            Err(AcnError::Trust(_))
        ));
    }

    #[tokio::test]
    async fn test_verified_session_carries_frames() {
        let node = TestNode::new();
        let signature = node.session_signature(&node.key);
        let uri = node.serve_once(signature).await;

        let channel = TlsChannel::new(uri, node.public_key_hex(), Duration::from_secs(2));
        assert!(channel.connect(Duration::from_secs(2)).await);
        channel.write(b"echo me").await.unwrap();
        assert_eq!(channel.read().await.unwrap().unwrap(), b"echo me");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_wrong_node_key_is_trust_failure() {
        let node = TestNode::new();
        let impostor = SigningKey::from_slice(&[9u8; 32]).unwrap();
        let signature = node.session_signature(&impostor);
        let uri = node.serve_once(signature).await;

        let channel = TlsChannel::new(uri, node.public_key_hex(), Duration::from_secs(2));
        let err = channel.open(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, AcnError::Trust(_)));
        assert!(matches!(
            channel.write(b"never sent").await,
            Err(AcnError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_missing_signature_is_trust_failure() {
        let node = TestNode::new();
        let uri = serve_silent(node.acceptor.clone()).await;

        let channel = TlsChannel::new(uri, node.public_key_hex(), Duration::from_secs(2));
        let err = channel.open(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, AcnError::Trust(_)), "got {err:?}");
        assert!(err.is_fatal());
        assert!(!channel.stream.is_open());
    }

    #[tokio::test]
    async fn test_pinned_config_rejects_other_certificate() {
        let node = TestNode::new();
        let other = TestNode::new();
        let uri = node.serve_once(node.session_signature(&node.key)).await;

        let fetched = fetch_certificate(&uri, Duration::from_secs(2)).await;
        // serve_once accepts a single session, which fetch_certificate used up.
        assert_eq!(fetched.unwrap().as_ref(), node.cert.as_ref());

        let uri = node.serve_once(Vec::new()).await;
        let pinned = client_config(Some(other.cert.clone())).unwrap();
        assert!(open_session(&uri, pinned, Duration::from_secs(2)).await.is_err());
    }

    #[test]
    fn test_certificate_public_key_is_uncompressed_point() {
        let node = TestNode::new();
        let key = certificate_public_key(node.cert.as_ref()).unwrap();
        assert_eq!(key.len(), 65);
        assert_eq!(key[0], 0x04);
    }
}
