//! Transport abstraction and QUIC endpoint construction.
//!
//! A [`Transport`] moves raw packets; [`crate::Peer`] interprets them. The
//! QUIC implementations live in [`crate::quic`]; this module provides the
//! trait plus the TLS-configured quinn endpoints they are built on (self-signed
//! certificates for development).

use crate::error::NetError;
use crate::handshake::Hail;
use crate::protocol::{
    ConnectionId, ConnectionStatus, DeliveryMethod, IncomingPacket, PeerRole, ALPN_PROTOCOL,
};
use anyhow::{Context, Result};
use quinn::{ClientConfig, Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Packet source/sink driven from the tick thread.
///
/// Implementations never block: `poll` returns `None` when nothing is queued
/// and sends are buffered.
pub trait Transport {
    /// Which side this transport plays.
    fn role(&self) -> PeerRole;

    /// Whether the transport is started and not shut down.
    fn is_running(&self) -> bool;

    /// Next queued inbound packet, if any.
    fn poll(&mut self) -> Option<IncomingPacket>;

    /// Queue `message` for delivery to `connection`.
    fn send(
        &mut self,
        connection: ConnectionId,
        message: Vec<u8>,
        delivery: DeliveryMethod,
    ) -> Result<(), NetError>;

    /// Accept a connection awaiting approval.
    fn approve(&mut self, connection: ConnectionId) -> Result<(), NetError>;

    /// Refuse a connection awaiting approval; `reason` is sent to the remote.
    fn deny(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError>;

    /// Close a connection; `reason` is sent to the remote.
    fn disconnect(&mut self, connection: ConnectionId, reason: &str) -> Result<(), NetError>;

    /// Current status of `connection`; unknown ids report `None`.
    fn status(&self, connection: ConnectionId) -> ConnectionStatus;

    /// Close every connection and stop.
    fn shutdown(&mut self, reason: &str);
}

/// Server side of a transport.
pub trait ServerTransport: Transport {
    /// Start accepting connections.
    fn start(&mut self) -> Result<(), NetError>;

    /// Bound address once started.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Client side of a transport.
pub trait ClientTransport: Transport {
    /// Begin connecting to `addr`, presenting `hail` for approval.
    ///
    /// Fails immediately if a connection already exists or the attempt
    /// cannot be initiated; the outcome otherwise arrives as a status packet.
    fn connect(&mut self, addr: SocketAddr, hail: &Hail) -> Result<(), NetError>;

    /// Id of the server connection, if one exists.
    fn server_connection(&self) -> Option<ConnectionId>;
}

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

fn transport_config() -> Result<Arc<quinn::TransportConfig>> {
    let mut config = quinn::TransportConfig::default();
    config.keep_alive_interval(Some(KEEP_ALIVE));
    config.max_idle_timeout(Some(
        IDLE_TIMEOUT
            .try_into()
            .context("Idle timeout out of range")?,
    ));
    Ok(Arc::new(config))
}

/// Build a server endpoint bound to `addr`.
///
/// Must be called within a tokio runtime context.
pub(crate) fn bind_server_endpoint(addr: SocketAddr) -> Result<Endpoint> {
    info!(%addr, "binding server endpoint");

    let _ = rustls::crypto::ring::default_provider().install_default();

    let (cert, key) = generate_self_signed_cert()?;
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .context("Failed to build rustls ServerConfig")?;
    server_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("Failed to create QuicServerConfig")?,
    ));
    server_config.transport_config(transport_config()?);

    let endpoint =
        Endpoint::server(server_config, addr).context("Failed to bind server endpoint")?;
    info!(addr = %endpoint.local_addr()?, "server endpoint bound");
    Ok(endpoint)
}

/// Build a client endpoint on an ephemeral port.
///
/// Accepts any server certificate. Must be called within a tokio runtime
/// context.
pub(crate) fn client_endpoint() -> Result<Endpoint> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("Failed to create QuicClientConfig")?,
    ));
    client_config.transport_config(transport_config()?);

    let mut endpoint = Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0)))
        .context("Failed to bind client endpoint")?;
    endpoint.set_default_client_config(client_config);
    debug!(addr = %endpoint.local_addr()?, "client endpoint created");
    Ok(endpoint)
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    debug!("generating self-signed certificate");

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate certificate")?;
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    Ok((CertificateDer::from(cert.cert), key))
}

/// Accepts every server certificate. Development only.
#[derive(Debug)]
struct SkipServerVerification;

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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_endpoint_binds_ephemeral_port() {
        let endpoint = bind_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(endpoint.local_addr().unwrap().port() > 0);
        endpoint.close(0u32.into(), b"done");
    }

    #[tokio::test]
    async fn client_reaches_server() {
        let server = bind_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let incoming = server.accept().await.expect("no incoming connection");
            incoming.await.expect("failed to accept connection")
        });

        let client = client_endpoint().unwrap();
        let connection = client
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .expect("failed to connect");
        let server_side = accept.await.unwrap();

        assert_eq!(connection.remote_address(), server_addr);
        assert!(server_side.remote_address().port() > 0);
        connection.close(0u32.into(), b"done");
    }
}
