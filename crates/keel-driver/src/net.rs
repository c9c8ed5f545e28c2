//! QUIC networking layer
//!
//! Endpoint setup and message framing for the reference store. Every request
//! travels on its own bidirectional stream as one length-prefixed bincode
//! message, answered by exactly one message.
//!
//! # Certificates
//!
//! Store hosts generate a self-signed certificate at startup and log its
//! BLAKE3 fingerprint. Clients either pin that fingerprint
//! (`network.cert_fingerprint`) or, when none is configured, accept any
//! certificate and say so in the log.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig, VarInt};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use thiserror::Error;
use tracing::{debug, info, warn};

use keel_core::{
    deserialize_message, serialize_message, NetMessage, NetworkConfig, ProtocolError,
    MAX_MESSAGE_SIZE,
};

/// Certificate fingerprint: BLAKE3 hash of the DER-encoded certificate
pub type CertFingerprint = [u8; 32];

/// Transport failures
#[derive(Debug, Clone, Error)]
pub enum NetError {
    #[error("endpoint setup failed: {0}")]
    Endpoint(String),

    #[error("tls configuration failed: {0}")]
    Tls(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out")]
    Timeout,

    #[error("stream open failed: {0}")]
    StreamOpen(String),

    #[error("stream accept failed: {0}")]
    StreamAccept(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// QUIC connection wrapper
#[derive(Clone)]
pub struct QuicConnection {
    connection: Connection,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Open a bidirectional stream
    pub async fn open_stream(&self) -> Result<(SendStream, RecvStream), NetError> {
        self.connection
            .open_bi()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))
    }

    /// Accept an incoming bidirectional stream
    pub async fn accept_stream(&self) -> Result<(SendStream, RecvStream), NetError> {
        self.connection
            .accept_bi()
            .await
            .map_err(|e| NetError::StreamAccept(e.to_string()))
    }

    /// One request/response exchange on a fresh stream
    pub async fn request(&self, msg: &NetMessage) -> Result<NetMessage, NetError> {
        let (mut send, mut recv) = self.open_stream().await?;
        send_message(&mut send, msg).await?;
        send.finish().map_err(|e| NetError::Send(e.to_string()))?;
        recv_message(&mut recv).await
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Set once the peer or the transport has closed the connection
    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    pub fn close(&self, code: u32, reason: &str) {
        self.connection.close(code.into(), reason.as_bytes());
    }
}

/// Send a message on a stream
pub async fn send_message(stream: &mut SendStream, msg: &NetMessage) -> Result<(), NetError> {
    let data = serialize_message(msg)
        .map_err(|e| NetError::Protocol(ProtocolError::Serialization(e.to_string())))?;

    stream
        .write_all(&data)
        .await
        .map_err(|e| NetError::Send(e.to_string()))
}

/// Receive a message from a stream
pub async fn recv_message(stream: &mut RecvStream) -> Result<NetMessage, NetError> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| NetError::Receive(e.to_string()))?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NetError::Protocol(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        }));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetError::Receive(e.to_string()))?;

    Ok(deserialize_message(&payload).map_err(ProtocolError::from)?)
}

/// Self-signed certificate for `names`
pub fn generate_self_signed_cert(
    names: Vec<String>,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), NetError> {
    let cert = rcgen::generate_simple_self_signed(names).map_err(|e| NetError::Tls(e.to_string()))?;
    let key_der = cert.get_key_pair().serialize_der();
    let cert_der = cert.serialize_der().map_err(|e| NetError::Tls(e.to_string()))?;
    let key = PrivatePkcs8KeyDer::from(key_der).into();
    Ok((vec![CertificateDer::from(cert_der)], key))
}

pub fn compute_cert_fingerprint(cert: &CertificateDer<'_>) -> CertFingerprint {
    keel_core::crypto::checksum(cert.as_ref())
}

/// Parse a hex fingerprint as written in the config file
pub fn parse_fingerprint(text: &str) -> Result<CertFingerprint, NetError> {
    let bytes = hex::decode(text.trim()).map_err(|e| NetError::Tls(format!("bad fingerprint: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| NetError::Tls("fingerprint must be 32 bytes".into()))
}

/// Transport parameters from the `[network]` config section
pub fn transport_config(config: &NetworkConfig) -> Result<TransportConfig, NetError> {
    let mut transport = TransportConfig::default();

    transport.keep_alive_interval(Some(config.keepalive()));
    let idle = config
        .idle_timeout()
        .try_into()
        .map_err(|_| NetError::Endpoint("idle timeout out of range".into()))?;
    transport.max_idle_timeout(Some(idle));
    transport.initial_rtt(Duration::from_millis(100));
    transport.max_concurrent_bidi_streams(VarInt::from_u32(128));
    transport.max_concurrent_uni_streams(VarInt::from_u32(0));

    Ok(transport)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Create a QUIC server endpoint with a fresh self-signed certificate
pub fn create_server_endpoint(
    bind_addr: SocketAddr,
    config: &NetworkConfig,
) -> Result<(Endpoint, CertFingerprint), NetError> {
    let (certs, key) = generate_self_signed_cert(vec![config.server_name.clone()])?;
    let fingerprint = compute_cert_fingerprint(&certs[0]);

    let crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| NetError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Tls(e.to_string()))?;

    let quic = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|e| NetError::Tls(e.to_string()))?;
    let mut server = ServerConfig::with_crypto(Arc::new(quic));
    server.transport_config(Arc::new(transport_config(config)?));

    let endpoint = Endpoint::server(server, bind_addr).map_err(|e| NetError::Endpoint(e.to_string()))?;

    info!("store endpoint on {} (cert fingerprint {})", bind_addr, hex::encode(fingerprint));
    Ok((endpoint, fingerprint))
}

/// Create a client endpoint able to reach `remote`
pub fn create_client_endpoint(
    remote: SocketAddr,
    config: &NetworkConfig,
) -> Result<Endpoint, NetError> {
    let bind_addr = match remote {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let mut endpoint = Endpoint::client(bind_addr).map_err(|e| NetError::Endpoint(e.to_string()))?;

    let provider = provider();
    let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> =
        match &config.cert_fingerprint {
            Some(text) => {
                let fingerprint = parse_fingerprint(text)?;
                debug!("pinning store certificate {}", hex::encode(fingerprint));
                Arc::new(PinnedCertVerifier::new(fingerprint, provider.clone()))
            }
            None => {
                warn!("no cert_fingerprint configured; store certificates are not verified");
                Arc::new(SkipServerVerification::new(provider.clone()))
            }
        };

    let crypto = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| NetError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| NetError::Tls(e.to_string()))?;
    let mut client = ClientConfig::new(Arc::new(quic));
    client.transport_config(Arc::new(transport_config(config)?));

    endpoint.set_default_client_config(client);
    Ok(endpoint)
}

/// Connect to a QUIC server within the configured connect timeout
pub async fn connect(
    endpoint: &Endpoint,
    addr: SocketAddr,
    config: &NetworkConfig,
) -> Result<QuicConnection, NetError> {
    let connecting = endpoint
        .connect(addr, &config.server_name)
        .map_err(|e| NetError::Connect(e.to_string()))?;

    let connection = tokio::time::timeout(config.connect_timeout(), connecting)
        .await
        .map_err(|_| NetError::Timeout)?
        .map_err(|e| NetError::Connect(e.to_string()))?;

    debug!("connected to {}", addr);
    Ok(QuicConnection::new(connection))
}

/// Accepts only the certificate with the pinned fingerprint
#[derive(Debug)]
struct PinnedCertVerifier {
    expected_fingerprint: CertFingerprint,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(expected_fingerprint: CertFingerprint, provider: Arc<CryptoProvider>) -> Self {
        Self {
            expected_fingerprint,
            provider,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let actual_fingerprint = compute_cert_fingerprint(end_entity);

        if actual_fingerprint == self.expected_fingerprint {
            debug!("certificate fingerprint verified: {}", hex::encode(actual_fingerprint));
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            warn!(
                "certificate fingerprint mismatch: expected {}, got {}",
                hex::encode(self.expected_fingerprint),
                hex::encode(actual_fingerprint)
            );
            Err(rustls::Error::General("certificate fingerprint mismatch".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Accepts any certificate (no fingerprint configured)
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl SkipServerVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_generation() {
        let (certs, _key) = generate_self_signed_cert(vec!["localhost".into()]).unwrap();
        assert_eq!(certs.len(), 1);
        let fingerprint = compute_cert_fingerprint(&certs[0]);
        assert_eq!(fingerprint, compute_cert_fingerprint(&certs[0]));
    }

    #[test]
    fn test_parse_fingerprint() {
        let fingerprint = [0xabu8; 32];
        assert_eq!(parse_fingerprint(&hex::encode(fingerprint)).unwrap(), fingerprint);
        assert!(parse_fingerprint("abcd").is_err());
        assert!(parse_fingerprint("not hex").is_err());
    }

    #[test]
    fn test_transport_config_from_network_section() {
        assert!(transport_config(&NetworkConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_message_exchange_over_loopback() {
        let config = NetworkConfig::default();
        let (server, fingerprint) =
            create_server_endpoint(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), &config).unwrap();
        let addr = server.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let incoming = server.accept().await.unwrap();
            let conn = QuicConnection::new(incoming.await.unwrap());
            let (mut send, mut recv) = conn.accept_stream().await.unwrap();
            let msg = recv_message(&mut recv).await.unwrap();
            assert!(matches!(msg, NetMessage::Goodbye));
            send_message(&mut send, &NetMessage::Ok).await.unwrap();
            send.finish().unwrap();
            // Keep the connection up until the client hangs up
            let _ = conn.accept_stream().await;
        });

        let pinned = NetworkConfig {
            cert_fingerprint: Some(hex::encode(fingerprint)),
            ..NetworkConfig::default()
        };
        let client = create_client_endpoint(addr, &pinned).unwrap();
        let conn = connect(&client, addr, &pinned).await.unwrap();
        let reply = conn.request(&NetMessage::Goodbye).await.unwrap();
        assert!(matches!(reply, NetMessage::Ok));

        conn.close(0, "done");
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_fingerprint_is_rejected() {
        let config = NetworkConfig::default();
        let (server, _) =
            create_server_endpoint(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), &config).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            if let Some(incoming) = server.accept().await {
                let _ = incoming.await;
            }
        });

        let pinned = NetworkConfig {
            cert_fingerprint: Some(hex::encode([7u8; 32])),
            ..NetworkConfig::default()
        };
        let client = create_client_endpoint(addr, &pinned).unwrap();
        assert!(connect(&client, addr, &pinned).await.is_err());
    }
}
