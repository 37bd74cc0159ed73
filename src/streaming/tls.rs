//! TLS client configuration for server streams.
//!
//! The server certificate must chain to one of the caller's CA
//! certificates. The hostname is not checked: servers are commonly reached
//! by IP address or a name absent from their certificate.

use std::io::BufReader;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::debug;

use crate::core::{CommoError, NetInterfaceErrorCode, Result};

/// PEM material for an authenticated server connection.
///
/// Kept as text so the HTTP client used for server-side mission package
/// transfers can be built from the same material.
#[derive(Clone)]
pub struct TlsCredentials {
    /// Client certificate chain, leaf first.
    pub client_cert_pem: String,
    /// Private key of the client certificate.
    pub client_key_pem: String,
    /// Trusted CA certificates.
    pub ca_certs_pem: String,
}

impl std::fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCredentials").finish_non_exhaustive()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(pem: &str) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes())).collect()
}

/// Load `ca_pem` into a root store. Fails on unreadable or empty input.
pub fn root_store(ca_pem: &str) -> Result<RootCertStore> {
    let certs = parse_certs(ca_pem).map_err(|_| CommoError::InvalidCaCert)?;
    if certs.is_empty() {
        return Err(CommoError::InvalidCaCert);
    }
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).map_err(|_| CommoError::InvalidCaCert)?;
    }
    Ok(roots)
}

/// Build a client config presenting the client certificate and trusting
/// only the supplied CAs.
pub fn client_config(creds: &TlsCredentials) -> Result<Arc<ClientConfig>> {
    let chain = parse_certs(&creds.client_cert_pem).map_err(|_| CommoError::InvalidCert)?;
    if chain.is_empty() {
        return Err(CommoError::InvalidCert);
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(creds.client_key_pem.as_bytes()))
        .map_err(|_| CommoError::InvalidCert)?
        .ok_or(CommoError::InvalidCert)?;
    let roots = root_store(&creds.ca_certs_pem)?;

    let provider = provider();
    let verifier = CaOnlyVerifier::new(roots, Arc::clone(&provider))?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CommoError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(chain, key)
        .map_err(|e| {
            debug!(error = %e, "client certificate rejected");
            CommoError::InvalidCert
        })?;
    Ok(Arc::new(config))
}

/// Build a config without a client certificate that trusts only `ca_pem`.
pub fn ca_only_config(ca_pem: &str) -> Result<Arc<ClientConfig>> {
    let roots = root_store(ca_pem)?;
    let provider = provider();
    let verifier = CaOnlyVerifier::new(roots, Arc::clone(&provider))?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CommoError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Chain verification without the name check.
#[derive(Debug)]
pub struct CaOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl CaOnlyVerifier {
    /// Verify against `roots` using `provider`'s algorithms.
    pub fn new(roots: RootCertStore, provider: Arc<CryptoProvider>) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|_| CommoError::InvalidCaCert)?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for CaOnlyVerifier {
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
            Ok(v) => Ok(v),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
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

/// Status code for a handshake rejected by rustls.
pub fn tls_error_code(err: &rustls::Error) -> NetInterfaceErrorCode {
    match err {
        rustls::Error::NoCertificatesPresented => NetInterfaceErrorCode::ConnSslNoPeerCert,
        rustls::Error::InvalidCertificate(_) => NetInterfaceErrorCode::ConnSslPeerCertNotTrusted,
        _ => NetInterfaceErrorCode::ConnSslHandshake,
    }
}

/// Status code for a handshake that failed on the socket.
pub fn handshake_error_code(err: &std::io::Error) -> NetInterfaceErrorCode {
    match err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
        Some(tls) => tls_error_code(tls),
        None => match err.kind() {
            std::io::ErrorKind::TimedOut => NetInterfaceErrorCode::ConnTimeout,
            _ => NetInterfaceErrorCode::ConnSslHandshake,
        },
    }
}

#[cfg(all(test, feature = "certgen"))]
mod tests {
    use super::*;
    use crate::crypto::certgen::generate_self_signed_cert;

    #[test]
    fn test_config_from_self_signed() {
        let (cert, key) = generate_self_signed_cert("commo-test").unwrap();
        let creds = TlsCredentials {
            client_cert_pem: cert.clone(),
            client_key_pem: key,
            ca_certs_pem: cert,
        };
        assert!(client_config(&creds).is_ok());
    }

    #[test]
    fn test_bad_material_rejected() {
        let (cert, key) = generate_self_signed_cert("commo-test").unwrap();
        let no_ca = TlsCredentials {
            client_cert_pem: cert.clone(),
            client_key_pem: key.clone(),
            ca_certs_pem: String::new(),
        };
        assert!(matches!(client_config(&no_ca), Err(CommoError::InvalidCaCert)));

        let no_cert = TlsCredentials {
            client_cert_pem: "garbage".into(),
            client_key_pem: key,
            ca_certs_pem: cert,
        };
        assert!(matches!(client_config(&no_cert), Err(CommoError::InvalidCert)));
    }

    #[test]
    fn test_handshake_codes() {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, rustls::Error::NoCertificatesPresented);
        assert_eq!(handshake_error_code(&err), NetInterfaceErrorCode::ConnSslNoPeerCert);
        let err = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert_eq!(handshake_error_code(&err), NetInterfaceErrorCode::ConnSslPeerCertNotTrusted);
        assert_eq!(
            tls_error_code(&rustls::Error::HandshakeNotComplete),
            NetInterfaceErrorCode::ConnSslHandshake
        );
    }
}
