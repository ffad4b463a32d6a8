use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::warn;

use crate::{Result, SecurityError};

/// Per-node transport identity: certificate/key pair for the listening
/// endpoint, plus how outbound connections verify their peers. The cert/key
/// paths come from the provisioning utility, one pair per node id.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// CA bundle used to verify peers on outbound connections.
    pub ca_path: Option<PathBuf>,
    /// When false, outbound connections trust whatever certificate the peer
    /// presents. Acceptable only outside production.
    pub verify_peer: bool,
}

/// Byte-stream security for a node's connections.
#[derive(Debug, Clone)]
pub enum TransportSecurity {
    /// No transport encryption. Development and test configurations only.
    Plain,
    Tls(TlsSettings),
}

impl TransportSecurity {
    pub fn is_plain(&self) -> bool {
        matches!(self, TransportSecurity::Plain)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(SecurityError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| SecurityError::Tls(format!("no private key found in {}", path.display())))
}

/// Builds the TLS acceptor for a listening endpoint from its identity.
pub fn server_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let certs = load_certs(&settings.cert_path)?;
    let key = load_key(&settings.key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| SecurityError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Builds the TLS connector for outbound connections.
///
/// With `verify_peer` set and a CA bundle configured, peer certificates are
/// verified against the bundle. Otherwise the connector runs trust-on-connect,
/// which is flagged loudly and must not reach production.
pub fn client_connector(settings: &TlsSettings) -> Result<TlsConnector> {
    let config = match (&settings.ca_path, settings.verify_peer) {
        (Some(ca_path), true) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| SecurityError::Tls(e.to_string()))?;
            }
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        _ => {
            warn!("peer verification disabled: outbound TLS runs trust-on-connect (non-production)");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(TrustOnConnect::new()))
                .with_no_client_auth()
        }
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts any server certificate. Signatures are still checked so the
/// session is encrypted against passive observers, but the peer identity is
/// not authenticated.
#[derive(Debug)]
struct TrustOnConnect {
    provider: CryptoProvider,
}

impl TrustOnConnect {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for TrustOnConnect {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
