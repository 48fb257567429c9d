//! rustls client setup for node connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use aerospike_core::{Error, Result};

use crate::config::TlsPolicy;

/// Shared TLS connector built once per cluster.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
    tls_name: Option<String>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("tls_name", &self.tls_name)
            .finish_non_exhaustive()
    }
}

impl TlsContext {
    /// Loads certificates and builds the connector.
    pub fn new(policy: &TlsPolicy) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let mut roots = RootCertStore::empty();
        if let Some(path) = policy.ca_cert_path() {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Configuration(format!("invalid CA certificate: {e}")))?;
            }
        }
        let roots = Arc::new(roots);

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Configuration(format!("unsupported TLS versions: {e}")))?;

        let builder = if policy.skip_name_verification() {
            let inner = WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                .build()
                .map_err(|e| Error::Configuration(format!("invalid TLS roots: {e}")))?;
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipNameVerifier { inner }))
        } else {
            builder.with_root_certificates(roots)
        };

        let config = match (policy.client_cert_path(), policy.client_key_path()) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| Error::Configuration(format!("invalid client certificate: {e}")))?,
            _ => builder.with_no_client_auth(),
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            tls_name: policy.tls_name().map(str::to_string),
        })
    }

    /// Performs the handshake over an established TCP stream.
    ///
    /// `tls_name` is the node's certificate name when known; otherwise the
    /// policy override or the host itself is used.
    pub async fn handshake(
        &self,
        stream: TcpStream,
        host: &str,
        tls_name: Option<&str>,
    ) -> Result<TlsStream<TcpStream>> {
        let name = tls_name
            .or(self.tls_name.as_deref())
            .unwrap_or(host)
            .to_string();
        let server_name = ServerName::try_from(name.clone())
            .map_err(|e| Error::Configuration(format!("invalid TLS name `{name}`: {e}")))?;

        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Connection(format!("TLS handshake with {name} failed: {e}")))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        Error::Configuration(format!("failed to open {}: {e}", path.display()))
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Configuration(format!("failed to parse {}: {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        Error::Configuration(format!("failed to open {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Configuration(format!("failed to parse {}: {e}", path.display())))?
        .ok_or_else(|| Error::Configuration(format!("no private key in {}", path.display())))
}

/// Validates the chain but accepts certificates issued for another name.
#[derive(Debug)]
struct SkipNameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SkipNameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsPolicyBuilder;

    #[test]
    fn test_missing_ca_file_is_configuration_error() {
        let policy = TlsPolicyBuilder::new()
            .ca_cert_path("/nonexistent/ca.pem")
            .build()
            .unwrap();
        let err = TlsContext::new(&policy).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_empty_roots_still_build() {
        let policy = TlsPolicyBuilder::new().enabled(true).build().unwrap();
        assert!(TlsContext::new(&policy).is_ok());
    }

    #[test]
    fn test_skip_name_verification_requires_roots() {
        let policy = TlsPolicyBuilder::new()
            .enabled(true)
            .skip_name_verification(true)
            .build()
            .unwrap();
        assert!(TlsContext::new(&policy).is_err());
    }
}
