//! TLS dialer using tokio-rustls
//!
//! Wraps a [`TcpDialer`] and performs a TLS handshake with Mozilla's root
//! certificates from `webpki-roots`. Used by upstream proxies marked
//! `secured` in the configuration.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::{BoxedStream, Dialer, TcpDialer, TransportError};

/// TLS-over-TCP dialer
#[derive(Clone)]
pub struct TlsDialer {
    tcp: TcpDialer,
    connector: TlsConnector,
    server_name: Option<String>,
}

impl TlsDialer {
    /// Create a dialer verifying certificates against the web PKI
    ///
    /// `server_name` overrides the SNI, which otherwise is the dialed host.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Tls` if the TLS configuration cannot be built.
    pub fn new(tcp: TcpDialer, server_name: Option<String>, skip_verify: bool) -> Result<Self, TransportError> {
        let config = create_tls_config(skip_verify)?;
        Ok(Self {
            tcp,
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

impl std::fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsDialer")
            .field("tcp", &self.tcp)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, TransportError> {
        let sni = self.server_name.as_deref().unwrap_or(host).to_string();
        let server_name: ServerName<'static> = ServerName::try_from(sni.clone())
            .map_err(|_| TransportError::Tls(format!("invalid server name '{sni}'")))?;

        let tcp = self.tcp.connect_tcp(host, port).await?;
        let stream = self
            .connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake with {sni} failed: {e}")))?;

        debug!(host, port, server_name = %sni, "TLS connection established");
        Ok(Box::new(stream))
    }
}

fn create_tls_config(skip_verify: bool) -> Result<ClientConfig, TransportError> {
    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let config = if skip_verify {
        // WARNING: Insecure - for testing only
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(root_store).with_no_client_auth()
    };
    Ok(config)
}

/// Certificate verifier that accepts anything
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
